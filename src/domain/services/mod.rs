mod key_resolver;

pub use key_resolver::KeyResolver;
