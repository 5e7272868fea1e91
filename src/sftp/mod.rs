//! File Transfer Pipeline
//!
//! Streams file bytes between the gateway host and a leased connection in
//! fixed-size chunks. Remote file access goes through the transport's SFTP
//! subsystem.

pub mod error;
pub mod transfer;

pub use error::TransferError;
pub use transfer::{
    TransferDirection, TransferJob, TransferPipeline, TransferProgress, TransferStatus,
    DEFAULT_CHUNK_SIZE,
};
