use std::fs::File;
use std::io;
use std::io::BufReader;
use std::io::BufWriter;
use std::path::Path;
use std::path::PathBuf;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Gzips `path` next to itself (`<name>.gz`) and deletes the source.
/// Returns the compressed path.
pub fn gzip_file(path: &Path) -> io::Result<PathBuf> {
    let dest = gz_path_for(path);
    let mut input = BufReader::new(File::open(path)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(&dest)?), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder
        .finish()?
        .into_inner()
        .map_err(|err| err.into_error())?;
    std::fs::remove_file(path)?;
    Ok(dest)
}

fn gz_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".gz");
    path.with_file_name(name)
}
