//! Temporary file format for spilled aggregate state.
//!
//! A file is a header followed by segments, one per non-empty bucket, in
//! strictly increasing bucket order:
//!
//! ```text
//! file:    [magic: 8 bytes][version: u32]
//! segment: [magic: u32][bucket: u32][row_count: u32][uncompressed_len: u32]
//!          [compressed_len: u32][checksum: u64][payload]
//! ```
//!
//! The payload is an lz4 compressed batch of the group columns followed by one
//! serialized state column per aggregate. The overflow row uses the bucket id
//! one past the last real bucket.

pub mod codec;
pub mod reader;
pub mod temporary;
pub mod writer;
