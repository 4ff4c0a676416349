//! Network Layer
//!
//! TCP server, HTTP framing and request routing.
//! All persistence goes through `splits/`.

pub mod http;
pub mod router;
pub mod server;

pub use self::http::{read_request, write_response, HttpError, Request, Response};
pub use router::{with_cors, Router};
pub use server::{ServerConfig, SplitServer, SplitServerError};
