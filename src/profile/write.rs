use std::fs::File;
use std::io;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::Profile;

/// Writes `<path>` as gzip-compressed profile JSON.
///
/// `finish` is what actually flushes the gzip trailer; without it the
/// viewer sees a truncated stream.
pub fn write_gz(path: impl AsRef<Path>, profile: &Profile) -> io::Result<()> {
    let file = File::create(path)?;
    let mut gz = GzEncoder::new(file, Compression::default());
    serde_json::to_writer(&mut gz, profile)?;
    let file = gz.finish()?;
    file.sync_all()
}
