use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub fn archive_path(output_dir: &Path, year: u16) -> PathBuf {
    let parent = output_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    parent.join(format!("nc_localities_output_{}.zip", year))
}

/// Zips every file under `output_dir` into `nc_localities_output_{year}.zip`
/// beside it. Entry names start with the output directory's own name.
pub fn pack_output(output_dir: &Path, year: u16) -> Result<PathBuf> {
    let dir_name = output_dir
        .file_name()
        .ok_or_else(|| anyhow!("Output directory has no name: {:?}", output_dir))?;
    let zip_path = archive_path(output_dir, year);

    let file = File::create(&zip_path)
        .with_context(|| format!("Failed to create archive: {:?}", zip_path))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut count = 0usize;
    for entry in WalkDir::new(output_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", output_dir))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(output_dir)?;
        let name = Path::new(dir_name)
            .join(relative)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        debug!("Adding {}", name);
        zip.start_file(name.as_str(), options)?;
        let mut src = File::open(entry.path())
            .with_context(|| format!("Failed to open {:?}", entry.path()))?;
        io::copy(&mut src, &mut zip)?;
        count += 1;
    }
    zip.finish()?;

    info!("Packaged {} files to {:?}", count, zip_path);
    Ok(zip_path)
}
