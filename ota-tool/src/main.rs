use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use moji_firmware::ota::manifest::UpdateManifest;
use moji_firmware::version::{compare_versions, CURRENT_VERSION};

#[derive(Parser)]
#[command(name = "ota-manifest")]
#[command(about = "Build and check Moji v3 OTA manifests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the version.json for a built image
    Create {
        /// Firmware image to describe
        firmware: PathBuf,

        /// Version the image reports (e.g. 3.1.0)
        #[arg(short, long)]
        version: String,

        /// Image URL, absolute or relative to the manifest
        #[arg(short, long)]
        url: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check an image against a manifest file
    Verify { manifest: PathBuf, firmware: PathBuf },
    /// Fetch a published manifest and decide what a device would do
    Check {
        manifest_url: String,

        /// Version the device is running
        #[arg(short, long, default_value = CURRENT_VERSION)]
        current: String,

        /// Also download the image and verify it
        #[arg(short, long)]
        download: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            firmware,
            version,
            url,
            output,
        } => create(&firmware, version, url, output.as_deref()),
        Commands::Verify { manifest, firmware } => {
            let manifest = load_manifest(&manifest)?;
            let image = fs::read(&firmware)
                .with_context(|| format!("reading {}", firmware.display()))?;
            verify(&manifest, &image)?;
            println!("{} {} matches manifest {}", "✅".green(), firmware.display(), manifest.target_version);
            Ok(())
        }
        Commands::Check {
            manifest_url,
            current,
            download,
        } => check(&manifest_url, &current, download),
    }
}

fn describe(image: &[u8], version: String, url: String) -> UpdateManifest {
    UpdateManifest {
        target_version: version,
        image_url: url,
        size: Some(image.len() as u64),
        sha256: Some(hex::encode(Sha256::digest(image))),
    }
}

fn create(firmware: &Path, version: String, url: String, output: Option<&Path>) -> Result<()> {
    let image = fs::read(firmware).with_context(|| format!("reading {}", firmware.display()))?;
    if image.is_empty() {
        bail!("{} is empty", firmware.display());
    }

    let manifest = describe(&image, version, url);
    let json = serde_json::to_string_pretty(&manifest)?;
    match output {
        Some(path) => {
            fs::write(path, &json)?;
            eprintln!(
                "{} {} ({} bytes, {:.2} MB)",
                "Wrote".green(),
                path.display(),
                image.len(),
                image.len() as f64 / 1024.0 / 1024.0
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn load_manifest(path: &Path) -> Result<UpdateManifest> {
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(UpdateManifest::parse(&body)?)
}

fn verify(manifest: &UpdateManifest, image: &[u8]) -> Result<()> {
    if let Some(size) = manifest.size {
        if size != image.len() as u64 {
            bail!("size mismatch: image is {} bytes, manifest says {}", image.len(), size);
        }
    }
    if let Some(expected) = manifest.digest()? {
        let actual: [u8; 32] = Sha256::digest(image).into();
        if actual != expected {
            bail!("sha256 mismatch: image is {}", hex::encode(actual));
        }
    }
    Ok(())
}

/// What a device running `current` would do with `manifest`.
struct Decision {
    newer: bool,
    /// Only resolved when the image is needed, as on the device.
    image_url: Option<String>,
}

fn decide(manifest: &UpdateManifest, manifest_url: &str, current: &str, download: bool) -> Result<Decision> {
    let newer = compare_versions(&manifest.target_version, current) == Ordering::Greater;
    let image_url = if newer || download {
        Some(manifest.resolve_image_url(manifest_url)?)
    } else {
        None
    };
    Ok(Decision { newer, image_url })
}

fn check(manifest_url: &str, current: &str, download: bool) -> Result<()> {
    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

    let response = client.get(manifest_url).send()?;
    if !response.status().is_success() {
        bail!("HTTP meta failed: {}", response.status());
    }
    let manifest = UpdateManifest::parse(&response.bytes()?)?;

    println!("📄 {}", manifest_url.cyan());
    println!("   Version: {}  (device: {})", manifest.target_version.bold(), current);
    if let Some(size) = manifest.size {
        println!("   Size:    {} bytes", size);
    }

    let decision = decide(&manifest, manifest_url, current, download)?;
    if let Some(url) = &decision.image_url {
        println!("   Image:   {}", url);
    }
    if decision.newer {
        println!("   {} device would update", "⬆".green());
    } else {
        println!("   {} device is running the latest version", "=".yellow());
    }

    if let (true, Some(url)) = (download, &decision.image_url) {
        let image = fetch_image(&client, url)?;
        verify(&manifest, &image)?;
        println!("   {} image verified ({} bytes)", "✅".green(), image.len());
    }
    Ok(())
}

fn fetch_image(client: &Client, url: &str) -> Result<Vec<u8>> {
    let mut response = client.get(url).send()?;
    if !response.status().is_success() {
        bail!("FW HTTP failed: {}", response.status());
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );

    let mut image = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = response.read(&mut buf)?;
        if n == 0 {
            break;
        }
        image.extend_from_slice(&buf[..n]);
        pb.inc(n as u64);
    }
    pb.finish_and_clear();
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_manifest_verifies_its_image() {
        let image = vec![0xA5u8; 3000];
        let manifest = describe(&image, "3.1.0".into(), "moji-3.1.0.bin".into());
        assert_eq!(manifest.size, Some(3000));
        assert!(verify(&manifest, &image).is_ok());

        let json = serde_json::to_vec(&manifest).unwrap();
        assert_eq!(UpdateManifest::parse(&json).unwrap(), manifest);
    }

    #[test]
    fn verify_rejects_tampered_image() {
        let image = vec![1u8; 64];
        let manifest = describe(&image, "3.1.0".into(), "fw.bin".into());
        let mut tampered = image.clone();
        tampered[10] = 2;
        assert!(verify(&manifest, &tampered).is_err());
        assert!(verify(&manifest, &image[..63]).is_err());
    }

    const MANIFEST_URL: &str = "http://ota.example.com/mojiv3/version.json";

    #[test]
    fn stale_manifest_without_url_needs_no_image() {
        let manifest = UpdateManifest::parse(br#"{"version":"3.0.2"}"#).unwrap();
        let decision = decide(&manifest, MANIFEST_URL, "3.0.2", false).unwrap();
        assert!(!decision.newer);
        assert_eq!(decision.image_url, None);

        // Downloading still needs somewhere to download from
        assert!(decide(&manifest, MANIFEST_URL, "3.0.2", true).is_err());
    }

    #[test]
    fn newer_manifest_resolves_image_url() {
        let manifest = UpdateManifest::parse(br#"{"version":"3.1.0","url":"fw.bin"}"#).unwrap();
        let decision = decide(&manifest, MANIFEST_URL, "3.0.2", false).unwrap();
        assert!(decision.newer);
        assert_eq!(
            decision.image_url.as_deref(),
            Some("http://ota.example.com/mojiv3/fw.bin")
        );

        let missing = UpdateManifest::parse(br#"{"version":"3.1.0"}"#).unwrap();
        assert!(decide(&missing, MANIFEST_URL, "3.0.2", false).is_err());
    }
}
