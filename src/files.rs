// Raw file handling around ingestion
//
// - blob_store: upload and converted-file directories on local disk
// - converter: RLD -> TXT conversion through an external tool

pub mod blob_store;
pub mod converter;

pub use blob_store::{BlobStore, BlobStoreError};
pub use converter::{
    is_binary_export, ConversionError, Converter, ExternalConverter, UnconfiguredConverter,
};
