pub mod config;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod model;
pub mod recorder;
pub mod renderer;
pub mod request;
pub mod server;
pub mod supervisor;
pub mod tls;

pub use config::CapConfig;
pub use error::{CapError, Result};
pub use model::Blueprint;
pub use server::{InstanceState, ServerInstance};
pub use supervisor::Supervisor;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        config::CapConfig,
        error::{CapError, Result},
        model::{Blueprint, ResponseCatalog, RequestRuleSet, ServerSpec},
        recorder::{RequestRecorder, Sinks},
        renderer::RenderedResponse,
        request::IncomingRequest,
        server::{InstanceState, ServerInstance},
        supervisor::Supervisor,
    };
    pub use bytes::Bytes;
    pub use hyper::{Method, StatusCode};
}
