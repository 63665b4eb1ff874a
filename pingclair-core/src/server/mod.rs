//! Edge HTTP listener: ACME HTTP-01 responder + redirect-to-HTTPS.

mod edge_http;

pub use edge_http::{EdgeHttpServer, HttpChallengeLookup};
