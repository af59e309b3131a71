//! Client side of the upload protocol.
//!
//! [`driver::UploadDriver`] moves part bytes straight to storage with bounded
//! concurrency; [`api::UploadClient`] wraps the JSON endpoints and owns the
//! retry and abort policy around the driver.

pub mod api;
pub mod driver;
pub mod http;

pub use api::{ClientConfig, ClientError, FileUpload, UploadClient, UploadedFile};
pub use driver::{
    DriverError, PartFailure, PartJob, PartProgress, PartTransport, ProgressReporter,
    TransportError, UploadDriver, UploadProgress, UploadSource,
};
pub use http::HttpPartTransport;
