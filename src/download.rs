//src/download.rs

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::{BlastaxError, Result};

/// NCBI taxonomy area, served over HTTPS.
pub const NCBI_TAXONOMY_URL: &str = "https://ftp.ncbi.nlm.nih.gov/pub/taxonomy";

/// Fetches reference files and verifies them against their published
/// `.md5` sidecars before anything downstream touches them.
pub struct Downloader {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl Downloader {
    pub fn new<S: Into<String>>(base_url: S) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("blastax/", env!("CARGO_PKG_VERSION")))
            // mapping files run to tens of gigabytes
            .timeout(Duration::from_secs(3600))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Downloader {
            client,
            base_url: base_url.into(),
        })
    }

    /// Downloads `name` into `dest_dir`, then checks it against the
    /// server's `name.md5`. A mismatch is fatal for the run.
    pub fn fetch_verified(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let path = dest_dir.join(name);
        self.fetch(name, &path)?;

        let expected = self.fetch_md5(name)?;
        let actual = md5_of_file(&path)?;
        if expected != actual {
            return Err(BlastaxError::Checksum {
                file: name.to_string(),
                expected,
                actual,
            });
        }
        log::info!("Downloaded and verified {}", name);
        Ok(path)
    }

    fn fetch(&self, name: &str, dest: &Path) -> Result<()> {
        let url = format!("{}/{}", self.base_url, name);
        log::info!("Fetching {}", url);
        let mut response = self.client.get(&url).send()?.error_for_status()?;
        let mut file = File::create(dest)?;
        response.copy_to(&mut file)?;
        Ok(())
    }

    /// The sidecar holds `<hex digest>  <filename>`; only the digest matters.
    fn fetch_md5(&self, name: &str) -> Result<String> {
        let url = format!("{}/{}.md5", self.base_url, name);
        let body = self.client.get(&url).send()?.error_for_status()?.text()?;
        body.split_whitespace()
            .next()
            .map(|s| s.to_lowercase())
            .ok_or_else(|| BlastaxError::Parse(format!("empty md5 sidecar for {}", name)))
    }
}

/// Streaming md5 of a local file.
fn md5_of_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Extracts a gzip-compressed tar archive (the NCBI taxdump) into
/// `dest_dir`.
pub fn extract_tar_gz(archive: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let decoder = GzDecoder::new(file);
    Archive::new(decoder).unpack(dest_dir)?;
    log::info!("Extracted {} into {}", archive.display(), dest_dir.display());
    Ok(())
}
