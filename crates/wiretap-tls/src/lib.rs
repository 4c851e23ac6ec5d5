mod ca;
mod error;
mod store;

pub use ca::{CaMaterial, CaSubject};
pub use error::TlsStoreError;
pub use store::TlsStore;
