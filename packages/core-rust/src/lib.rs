//! `Bindwire` Core: document model, runtime expressions, schemas, and payload serializers.

pub mod document;
pub mod expression;
pub mod schema;
pub mod serialization;
pub mod types;

pub use document::{
    AsyncApiDocument, BindingSet, ChannelDescriptor, CorrelationIdDefinition, DocumentError,
    DocumentModel, MessageDefinition, OperationAction, ParameterDefinition, ResolvedOperation,
    ServerDefinition,
};
pub use expression::{ExpressionCache, ExpressionError, ExpressionSource, RuntimeExpression};
pub use schema::{
    SchemaDefinition, SchemaError, SchemaHandler, SchemaRef, SchemaRegistry, ValidationResult,
};
pub use serialization::{SerializationError, Serializer, SerializerProvider, DEFAULT_CONTENT_TYPE};
pub use types::{headers_from, Headers, OrderedMap, Value};
