use thiserror::Error;

#[derive(Error, Debug)]
pub enum RttiError {
    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("type '{0}' is already registered")]
    DuplicateType(String),

    #[error("class '{0}' is abstract and cannot be instantiated")]
    AbstractClass(String),

    #[error("class '{0}' is not constructible")]
    NotConstructible(String),

    #[error("class '{class}' has no property '{property}'")]
    UnknownProperty { class: String, property: String },

    #[error("value of type '{found}' cannot be stored in a '{expected}' slot")]
    ValueTypeMismatch { expected: String, found: String },
}
