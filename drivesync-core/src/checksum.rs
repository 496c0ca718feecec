//! MD5 content checksums
//!
//! The remote service reports an md5 for every downloadable blob; local
//! files are hashed with the same digest so the engine can skip redundant
//! transfers in both directions.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::Result;

/// Hash a byte slice to a lowercase hex md5 digest
pub fn md5_of_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Hash a file on disk, streaming in 64 KiB blocks
pub async fn md5_of_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }

    Ok(format!("{:x}", context.compute()))
}
