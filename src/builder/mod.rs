//! # Configuration builder pattern
//!
//! Operator choices are collected through a builder and validated once at
//! [`Builder::try_build`]. A successful build yields an immutable
//! [DomainConfig](crate::descriptor::DomainConfig); constraint checks that
//! depend on how the fields combine (thread ranges, paired passthrough) live
//! in the synthesizer, the builder only enforces presence.

pub mod domain;

fn assert_not_none<T>(key: &str, value: &Option<T>) -> Result<(), BuilderError> {
    match value {
        Some(_) => Ok(()),
        None => Err(BuilderError::MissingRequiredField(key.to_string())),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuilderError {
    /// The field is required but was not provided in the builder object
    MissingRequiredField(String),
}

/// Generic trait all builder components implement.
pub trait Builder<T> {
    /// Validate all the fields from the builder object and apply it to the
    /// final object.
    fn try_build(self) -> Result<T, BuilderError>;
}
