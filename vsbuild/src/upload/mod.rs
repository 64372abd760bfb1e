//! Local download cache and remote datastore cache.
//!
//! | local hit | remote hit | overwrite            | action                              |
//! |-----------|------------|----------------------|-------------------------------------|
//! | yes       |            | local = false        | use the cached file                 |
//! | yes       |            | local = true         | delete the cached file, download    |
//! |           | yes        | remote = false       | reuse the remote file               |
//! |           | yes        | remote = true        | delete the remote file, upload      |
//! |           | no         |                      | create the directory, upload        |

mod checksum;
mod download;
mod local;
mod remote;

pub use checksum::{file_digest, sha256_hex, Checksum, ChecksumAlgorithm};
#[cfg(feature = "http")]
pub use download::HttpDownloader;
pub use download::{local_source, DefaultDownloader, Downloader, FileDownloader};
pub use local::LocalCache;
pub use remote::{remove_uploaded, RemoteCache, UploadedObject};
