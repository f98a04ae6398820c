//! `Bindwire` Client: publishes and subscribes by operation id, dispatching to
//! protocol binding handlers selected from the document's servers.

pub mod binding;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod matcher;
pub mod message;
pub mod native;
pub mod observer;
pub mod pipeline;
pub mod registry;
pub mod stream;
pub mod subscription;
pub mod telemetry;

pub use binding::{BindingHandler, HandlerServices, ProtocolAdapter, ProtocolBindingHandler};
pub use client::{AsyncApiClient, ClientBuilder, ClientState, PublishRequest, SubscribeRequest};
pub use config::ClientConfig;
pub use context::{ContextTemplate, OperationContext, ServerSelector};
pub use error::{ClientError, MatchError};
pub use message::{DecodedMessage, PublishMetadata, PublishReceipt};
pub use native::{InMemoryBroker, NativeConnector};
pub use observer::{ChannelObserver, FnObserver, MessageObserver};
pub use registry::BindingHandlerRegistry;
pub use subscription::{SharedSubscription, SubscriptionHandle};
pub use telemetry::{init_logging, LogFormat};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
