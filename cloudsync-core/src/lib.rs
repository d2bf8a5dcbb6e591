mod event;
mod listing;
mod request;
mod transport;

pub use event::{Event, EventClass, FailureKind, TransportFailure};
pub use listing::{
    ListedResource, Listing, ListingClient, ListingError, ListingPage, ResourceType,
};
pub use request::{
    CompletionProbe, DownloadTarget, Method, REQUEST_ID_HEADER, Request, RequestBody,
    RequestError, join_remote_path,
};
pub use transport::{
    DEFAULT_MAX_CONCURRENT_REQUESTS, HttpTransport, Transport, TransportConfig, TransportError,
};
