use crate::supervisor::{ImageConfig, ImageInfo};
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

const LXC_IMAGE_BASE: &str = "https://images.linuxcontainers.org/images";

/// `(reference name, LXC distribution, default release)`.
const DISTRIBUTIONS: &[(&str, &str, &str)] = &[
    ("alpine", "alpine", "3.20"),
    ("ubuntu", "ubuntu", "noble"),
    ("debian", "debian", "bookworm"),
    ("fedora", "fedora", "41"),
    ("archlinux", "archlinux", "current"),
    ("arch", "archlinux", "current"),
    ("opensuse", "opensuse", "tumbleweed"),
    ("opensuse/tumbleweed", "opensuse", "tumbleweed"),
    ("opensuse/leap", "opensuse", "15.6"),
];

/// Numeric tags that the image server knows by codename.
const RELEASE_ALIASES: &[(&str, &str, &str)] = &[
    ("ubuntu", "24.04", "noble"),
    ("ubuntu", "22.04", "jammy"),
    ("ubuntu", "20.04", "focal"),
    ("ubuntu", "24.10", "oracular"),
    ("debian", "13", "trixie"),
    ("debian", "12", "bookworm"),
    ("debian", "11", "bullseye"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Lxc { distro: String, release: String },
    Url { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Normalized reference, `name:tag`.
    pub name: String,
    pub source: ImageSource,
    pub cache_key: String,
}

/// Strip registry and library prefixes: `docker.io/library/alpine:3` → `alpine:3`.
pub fn normalize_reference(reference: &str) -> String {
    let r = reference.trim();
    if r.starts_with("http://") || r.starts_with("https://") {
        return r.to_owned();
    }
    let r = r
        .trim_start_matches("docker.io/")
        .trim_start_matches("library/");
    let has_tag = r.rsplit('/').next().is_some_and(|last| last.contains(':'));
    if has_tag || r.contains('@') {
        r.to_owned()
    } else {
        format!("{r}:latest")
    }
}

pub fn resolve_image(reference: &str) -> Result<ResolvedImage, RuntimeError> {
    let name = normalize_reference(reference);
    if name.starts_with("http://") || name.starts_with("https://") {
        return Ok(ResolvedImage {
            cache_key: format!("url-{}", &blake3::hash(name.as_bytes()).to_hex()[..16]),
            source: ImageSource::Url { url: name.clone() },
            name,
        });
    }

    let (repo, tag) = name.rsplit_once(':').unwrap_or((name.as_str(), "latest"));
    let repo_lower = repo.to_lowercase();
    let Some((_, distro, default_release)) =
        DISTRIBUTIONS.iter().find(|(n, _, _)| *n == repo_lower)
    else {
        let known: Vec<&str> = DISTRIBUTIONS.iter().map(|(n, _, _)| *n).collect();
        return Err(RuntimeError::ImageNotFound(format!(
            "unknown image '{reference}'. Supported: {}, or an http(s) rootfs tarball URL",
            known.join(", ")
        )));
    };
    let release = if tag == "latest" {
        (*default_release).to_owned()
    } else {
        RELEASE_ALIASES
            .iter()
            .find(|(d, t, _)| d == distro && *t == tag)
            .map_or_else(|| tag.to_owned(), |(_, _, codename)| (*codename).to_owned())
    };

    Ok(ResolvedImage {
        cache_key: format!("{distro}-{release}"),
        source: ImageSource::Lxc {
            distro: (*distro).to_owned(),
            release,
        },
        name,
    })
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "arm" => "armhf",
        "riscv64" => "riscv64",
        _ => "amd64",
    }
}

fn lxc_index_url(distro: &str, release: &str) -> String {
    format!("{LXC_IMAGE_BASE}/{distro}/{release}/{}/default/", host_arch())
}

/// Build dates on the image server look like `20260220_04:20`, possibly URL-encoded.
pub fn latest_build(index_html: &str) -> Option<String> {
    let mut builds: Vec<String> = index_html
        .lines()
        .filter_map(|line| {
            let href = line.split("href=\"").nth(1)?;
            let raw = href.split('"').next()?;
            let decoded = raw.trim_end_matches('/').replace("%3A", ":");
            (decoded.starts_with(|c: char| c.is_ascii_digit()) && decoded.len() >= 8)
                .then_some(decoded)
        })
        .collect();
    builds.sort();
    builds.pop()
}

/// Image metadata stored next to the unpacked rootfs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageRecord {
    name: String,
    digest: String,
    #[serde(default)]
    config: ImageConfig,
}

/// Root filesystem tarballs unpacked under `<data-root>/images/<cache-key>/`.
pub struct ImageCache {
    cache_dir: PathBuf,
    ca_dirs: Vec<PathBuf>,
}

impl ImageCache {
    pub fn new(images_dir: impl Into<PathBuf>, ca_dirs: Vec<PathBuf>) -> Self {
        Self {
            cache_dir: images_dir.into(),
            ca_dirs,
        }
    }

    pub fn rootfs_path(&self, cache_key: &str) -> PathBuf {
        self.cache_dir.join(cache_key).join("rootfs")
    }

    fn tarball_path(&self, cache_key: &str) -> PathBuf {
        self.cache_dir.join(cache_key).join("rootfs.tar.xz")
    }

    fn record_path(&self, cache_key: &str) -> PathBuf {
        self.cache_dir.join(cache_key).join("image.json")
    }

    pub fn is_cached(&self, cache_key: &str) -> bool {
        self.record_path(cache_key).is_file()
    }

    fn curl(&self) -> Command {
        let mut cmd = Command::new("curl");
        cmd.args(["-fSL", "--retry", "2"]);
        if let Some(dir) = self.ca_dirs.iter().find(|d| d.is_dir()) {
            cmd.arg("--capath").arg(dir);
        }
        cmd
    }

    fn download_url(&self, source: &ImageSource) -> Result<String, RuntimeError> {
        match source {
            ImageSource::Url { url } => Ok(url.clone()),
            ImageSource::Lxc { distro, release } => {
                let index = lxc_index_url(distro, release);
                let output = self
                    .curl()
                    .args(["-s", "--max-time", "30", &index])
                    .output()
                    .map_err(|e| RuntimeError::ExecFailed(format!("curl failed: {e}")))?;
                if !output.status.success() {
                    return Err(RuntimeError::ImageNotFound(format!(
                        "failed to fetch image index from {index}: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                let build = latest_build(&String::from_utf8_lossy(&output.stdout))
                    .ok_or_else(|| RuntimeError::ImageNotFound(format!("no builds at {index}")))?;
                Ok(format!("{index}{}/rootfs.tar.xz", build.replace(':', "%3A")))
            }
        }
    }

    /// Download the tarball without unpacking it.
    pub fn fetch(&self, resolved: &ResolvedImage) -> Result<PathBuf, RuntimeError> {
        let tarball = self.tarball_path(&resolved.cache_key);
        if tarball.is_file() {
            return Ok(tarball);
        }
        std::fs::create_dir_all(self.cache_dir.join(&resolved.cache_key))?;
        let url = self.download_url(&resolved.source)?;
        info!("downloading {url}");
        let partial = tarball.with_extension("partial");
        let status = self
            .curl()
            .args(["--max-time", "600", "-o"])
            .arg(&partial)
            .arg(&url)
            .status()
            .map_err(|e| RuntimeError::ExecFailed(format!("curl download failed: {e}")))?;
        if !status.success() {
            let _ = std::fs::remove_file(&partial);
            return Err(RuntimeError::ExecFailed(format!(
                "failed to download image from {url}"
            )));
        }
        std::fs::rename(&partial, &tarball)?;
        Ok(tarball)
    }

    /// Fetch and unpack, or return the cached image.
    pub fn ensure(&self, resolved: &ResolvedImage, force: bool) -> Result<ImageInfo, RuntimeError> {
        if self.is_cached(&resolved.cache_key) && !force {
            debug!("using cached image {}", resolved.name);
            return self.load(&resolved.cache_key);
        }
        if force {
            let _ = std::fs::remove_file(self.tarball_path(&resolved.cache_key));
        }
        let tarball = self.fetch(resolved)?;
        let rootfs = self.rootfs_path(&resolved.cache_key);
        if rootfs.exists() {
            force_remove(&rootfs)?;
        }
        std::fs::create_dir_all(&rootfs)?;

        let status = Command::new("tar")
            .arg("xf")
            .arg(&tarball)
            .arg("-C")
            .arg(&rootfs)
            .args(["--no-same-owner", "--exclude=dev/*"])
            .status()
            .map_err(|e| RuntimeError::ExecFailed(format!("tar extract failed: {e}")))?;
        if !status.success() {
            let _ = force_remove(&rootfs);
            return Err(RuntimeError::ExecFailed(
                "failed to extract rootfs tarball".to_owned(),
            ));
        }

        let data = std::fs::read(&tarball)?;
        let record = ImageRecord {
            name: resolved.name.clone(),
            digest: format!("blake3:{}", blake3::hash(&data).to_hex()),
            config: ImageConfig::default(),
        };
        std::fs::write(
            self.record_path(&resolved.cache_key),
            serde_json::to_vec_pretty(&record)?,
        )?;
        info!("image {} ready", resolved.name);
        self.load(&resolved.cache_key)
    }

    fn load(&self, cache_key: &str) -> Result<ImageInfo, RuntimeError> {
        let data = std::fs::read(self.record_path(cache_key))
            .map_err(|_| RuntimeError::ImageNotFound(cache_key.to_owned()))?;
        let record: ImageRecord = serde_json::from_slice(&data)?;
        Ok(ImageInfo {
            name: record.name,
            rootfs: self.rootfs_path(cache_key),
            digest: record.digest,
            config: record.config,
        })
    }

    pub fn get(&self, resolved: &ResolvedImage) -> Result<ImageInfo, RuntimeError> {
        if !self.is_cached(&resolved.cache_key) {
            return Err(RuntimeError::ImageNotFound(resolved.name.clone()));
        }
        self.load(&resolved.cache_key)
    }

    pub fn list(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.cache_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let key = entry?.file_name().to_string_lossy().into_owned();
            if self.is_cached(&key) {
                out.push(self.load(&key)?);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn remove(&self, resolved: &ResolvedImage) -> Result<(), RuntimeError> {
        let dir = self.cache_dir.join(&resolved.cache_key);
        if !dir.exists() {
            return Err(RuntimeError::ImageNotFound(resolved.name.clone()));
        }
        force_remove(&dir)
    }
}

/// Remove a tree even when unpacking left read-only directories behind.
pub fn force_remove(path: &Path) -> Result<(), RuntimeError> {
    if path.exists() {
        let _ = Command::new("chmod")
            .arg("-R")
            .arg("u+rwX")
            .arg(path)
            .status();
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_registry() {
        assert_eq!(normalize_reference("alpine"), "alpine:latest");
        assert_eq!(
            normalize_reference("docker.io/library/alpine:3.19"),
            "alpine:3.19"
        );
        assert_eq!(
            normalize_reference("opensuse/leap"),
            "opensuse/leap:latest"
        );
    }

    #[test]
    fn resolve_known_distributions() {
        let r = resolve_image("alpine").unwrap();
        assert_eq!(r.cache_key, "alpine-3.20");
        let r = resolve_image("ubuntu:22.04").unwrap();
        assert_eq!(
            r.source,
            ImageSource::Lxc {
                distro: "ubuntu".to_owned(),
                release: "jammy".to_owned()
            }
        );
        let r = resolve_image("arch").unwrap();
        assert_eq!(r.cache_key, "archlinux-current");
    }

    #[test]
    fn resolve_url_and_unknown() {
        let r = resolve_image("https://example.com/rootfs.tar.xz").unwrap();
        assert!(r.cache_key.starts_with("url-"));
        assert!(resolve_image("nginx").is_err());
    }

    #[test]
    fn latest_build_from_index() {
        let html = r#"<a href="20260219_04%3A20/">x</a>
<a href="20260220_04%3A20/">y</a>
<a href="../">up</a>"#;
        assert_eq!(latest_build(html).as_deref(), Some("20260220_04:20"));
        assert_eq!(latest_build("<html></html>"), None);
    }

    #[test]
    fn cache_lookup_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path(), Vec::new());
        let resolved = resolve_image("alpine").unwrap();
        assert!(cache.get(&resolved).unwrap_err().is_not_found());

        std::fs::create_dir_all(cache.rootfs_path(&resolved.cache_key)).unwrap();
        let record = ImageRecord {
            name: resolved.name.clone(),
            digest: "blake3:00".to_owned(),
            config: ImageConfig::default(),
        };
        std::fs::write(
            cache.record_path(&resolved.cache_key),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
        let info = cache.get(&resolved).unwrap();
        assert_eq!(info.name, "alpine:latest");
        assert_eq!(info.config.cmd, vec!["/bin/sh"]);
        assert_eq!(cache.list().unwrap().len(), 1);
        cache.remove(&resolved).unwrap();
        assert!(cache.list().unwrap().is_empty());
    }
}
