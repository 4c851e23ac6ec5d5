pub mod body;
pub mod error;
pub mod headers;
pub mod method;
pub mod request;
pub mod response;

mod token;

pub use body::{BodyReader, Framing};
pub use headers::Headers;
pub use method::Method;
pub use request::{Request, Scheme};
pub use response::Response;
