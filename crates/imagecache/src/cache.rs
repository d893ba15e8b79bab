//! The cache itself: token allocation, lookup, commit, removal.

use crate::error::{CacheError, CacheResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use volprov_core::checksum::{is_sha256_hex, normalize_sha256_hex, sha256_file, token_from_url};

/// Filename suffix of the commit marker.
const SIDECAR_SUFFIX: &str = ".sha256";

/// Cache directories are owner rwx, group rx.
#[cfg(unix)]
const DIR_MODE: u32 = 0o750;

/// Cache files are owner rw only.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// A present cache entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

/// A directory of cached images committed by `.sha256` sidecars.
#[derive(Clone, Debug)]
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the cache root (with restricted permissions) if needed.
    async fn ensure_root(&self) -> CacheResult<()> {
        fs::create_dir_all(&self.root).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.root, std::fs::Permissions::from_mode(DIR_MODE)).await?;
        }
        Ok(())
    }

    /// Reserve the path a fresh download will be written to.
    ///
    /// Ensures the root exists but does not create the file. The token
    /// must be a sanitized identifier (see
    /// [`volprov_core::checksum::token_from_url`]).
    pub async fn allocate_path(&self, token: &str) -> CacheResult<PathBuf> {
        if token.is_empty()
            || !token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(CacheError::InvalidToken(token.to_string()));
        }
        self.ensure_root().await?;
        Ok(self.root.join(token))
    }

    /// Look up an entry by cache key.
    ///
    /// The key is either a hex SHA-256 checksum or, when no checksum could
    /// be resolved for the image, the image URL itself. Checksum keys probe
    /// `<root>/<checksum>.sha256` first and then fall back to matching
    /// sidecar contents, so entries committed under URL-derived names are
    /// still found. URL keys probe the derived token pair directly.
    pub async fn lookup(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        self.ensure_root().await?;

        if is_sha256_hex(key.trim()) {
            let checksum = key.trim().to_ascii_lowercase();

            let named = self.root.join(format!("{checksum}{SIDECAR_SUFFIX}"));
            if fs::try_exists(&named).await? {
                if let Some(entry) = self.entry_for_sidecar(&named).await? {
                    return Ok(Some(entry));
                }
            }

            let mut dir = fs::read_dir(&self.root).await?;
            while let Some(dirent) = dir.next_entry().await? {
                let name = dirent.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.ends_with(SIDECAR_SUFFIX) {
                    continue;
                }
                let sidecar = dirent.path();
                match fs::read_to_string(&sidecar).await {
                    Ok(content) if content.trim() == checksum => {
                        if let Some(entry) = self.entry_for_sidecar(&sidecar).await? {
                            return Ok(Some(entry));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(sidecar = %sidecar.display(), error = %e, "Unreadable sidecar, skipping");
                    }
                }
            }
            Ok(None)
        } else {
            let token = token_from_url(key);
            let sidecar = self.root.join(format!("{token}{SIDECAR_SUFFIX}"));
            if !fs::try_exists(&sidecar).await? {
                return Ok(None);
            }
            self.entry_for_sidecar(&sidecar).await
        }
    }

    /// Resolve a sidecar path into an entry, or a miss when the sidecar is
    /// invalid or its image partner is gone.
    async fn entry_for_sidecar(&self, sidecar: &Path) -> CacheResult<Option<CacheEntry>> {
        let content = match fs::read_to_string(sidecar).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checksum = match normalize_sha256_hex(&content) {
            Ok(checksum) => checksum,
            Err(_) => {
                tracing::warn!(
                    sidecar = %sidecar.display(),
                    "Sidecar does not contain a valid SHA-256 digest, treating as miss"
                );
                return Ok(None);
            }
        };

        let image = sidecar.with_extension("");
        match fs::metadata(&image).await {
            Ok(meta) => Ok(Some(CacheEntry {
                path: image,
                size: meta.len(),
                checksum,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    sidecar = %sidecar.display(),
                    image = %image.display(),
                    "Orphaned sidecar: image file missing"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit a fully materialized image by writing its sidecar.
    ///
    /// The caller must have made the image fsync-durable first; the
    /// sidecar itself is synced before this returns, so a crash never
    /// leaves a committed entry with a torn marker.
    pub async fn commit(&self, path: &Path, checksum: &str) -> CacheResult<()> {
        let checksum =
            normalize_sha256_hex(checksum).map_err(|e| CacheError::InvalidChecksum(e.to_string()))?;
        self.confine(path)?;

        let sidecar = sidecar_path(path);
        let mut file = fs::File::create(&sidecar).await?;
        file.write_all(checksum.as_bytes()).await?;
        file.sync_all().await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&sidecar, std::fs::Permissions::from_mode(FILE_MODE)).await?;
        }
        Ok(())
    }

    /// Best-effort removal of an image and its sidecar. Missing files are
    /// not errors.
    pub async fn remove(&self, path: &Path) -> CacheResult<()> {
        self.confine(path)?;
        for target in [path.to_path_buf(), sidecar_path(path)] {
            match fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %target.display(), error = %e, "Failed to remove cache file");
                }
            }
        }
        Ok(())
    }

    /// Compute the SHA-256 of a file inside the cache root.
    ///
    /// The path must canonicalize to a descendant of the root before any
    /// byte is read; this helper is reachable from job records and must
    /// not double as a general file-read primitive.
    pub async fn compute_checksum(&self, path: &Path) -> CacheResult<String> {
        self.ensure_root().await?;
        let root = fs::canonicalize(&self.root).await?;
        let resolved = fs::canonicalize(path).await?;
        if !resolved.starts_with(&root) {
            return Err(CacheError::PathEscape(path.display().to_string()));
        }

        tokio::task::spawn_blocking(move || sha256_file(&resolved))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(format!("hash task failed: {e}"))))?
            .map_err(CacheError::Io)
    }

    /// Cheap containment check for paths the cache hands out itself.
    fn confine(&self, path: &Path) -> CacheResult<()> {
        let escapes = path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
            || path.parent() != Some(self.root.as_path());
        if escapes {
            return Err(CacheError::PathEscape(path.display().to_string()));
        }
        Ok(())
    }
}

fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUM_A: &str =
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    async fn cache() -> (tempfile::TempDir, ImageCache) {
        let temp = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(temp.path().join("images"));
        (temp, cache)
    }

    async fn write_image(cache: &ImageCache, token: &str, data: &[u8]) -> PathBuf {
        let path = cache.allocate_path(token).await.unwrap();
        fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn allocate_rejects_unsafe_tokens() {
        let (_temp, cache) = cache().await;
        assert!(cache.allocate_path("ubuntu").await.is_ok());
        assert!(cache.allocate_path("").await.is_err());
        assert!(cache.allocate_path("a/b").await.is_err());
        assert!(cache.allocate_path("..").await.is_err());
        assert!(cache.allocate_path("name.ext").await.is_err());
    }

    #[tokio::test]
    async fn commit_then_lookup_by_checksum_finds_token_named_entry() {
        let (_temp, cache) = cache().await;
        let path = write_image(&cache, "ubuntu", b"image-bytes").await;
        cache.commit(&path, CHECKSUM_A).await.unwrap();

        let entry = cache.lookup(CHECKSUM_A).await.unwrap().unwrap();
        assert_eq!(
            entry,
            CacheEntry {
                path,
                size: 11,
                checksum: CHECKSUM_A.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn lookup_by_checksum_filename_fast_path() {
        let (_temp, cache) = cache().await;
        let path = write_image(&cache, &"b".repeat(64), b"data").await;
        cache.commit(&path, &"b".repeat(64)).await.unwrap();

        let entry = cache.lookup(&"b".repeat(64)).await.unwrap().unwrap();
        assert_eq!(entry.path, path);
    }

    #[tokio::test]
    async fn lookup_by_url_key_probes_derived_token() {
        let (_temp, cache) = cache().await;
        let path = write_image(&cache, "ubuntu", b"image-bytes").await;
        cache.commit(&path, CHECKSUM_A).await.unwrap();

        let url = "http://obj/images/ubuntu.qcow2";
        let entry = cache.lookup(url).await.unwrap().unwrap();
        assert_eq!(entry.path, path);
        assert_eq!(entry.checksum, CHECKSUM_A);

        assert!(cache
            .lookup("http://obj/images/other.qcow2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn orphan_sidecar_is_a_miss() {
        let (_temp, cache) = cache().await;
        let path = write_image(&cache, "ubuntu", b"image-bytes").await;
        cache.commit(&path, CHECKSUM_A).await.unwrap();
        fs::remove_file(&path).await.unwrap();

        assert!(cache.lookup(CHECKSUM_A).await.unwrap().is_none());
        assert!(cache
            .lookup("http://obj/images/ubuntu.qcow2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn malformed_sidecar_is_a_miss() {
        let (_temp, cache) = cache().await;
        let path = write_image(&cache, "ubuntu", b"image-bytes").await;
        fs::write(sidecar_path(&path), "not-a-digest").await.unwrap();

        assert!(cache
            .lookup("http://obj/images/ubuntu.qcow2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn commit_rejects_bad_checksums_and_foreign_paths() {
        let (_temp, cache) = cache().await;
        let path = write_image(&cache, "ubuntu", b"image-bytes").await;
        assert!(cache.commit(&path, "short").await.is_err());
        assert!(cache
            .commit(Path::new("/etc/passwd"), CHECKSUM_A)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn remove_deletes_pair_and_is_idempotent() {
        let (_temp, cache) = cache().await;
        let path = write_image(&cache, "ubuntu", b"image-bytes").await;
        cache.commit(&path, CHECKSUM_A).await.unwrap();

        cache.remove(&path).await.unwrap();
        assert!(!fs::try_exists(&path).await.unwrap());
        assert!(!fs::try_exists(&sidecar_path(&path)).await.unwrap());

        // Removing again is still ok.
        cache.remove(&path).await.unwrap();
        assert!(cache.lookup(CHECKSUM_A).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compute_checksum_confined_to_root() {
        let (temp, cache) = cache().await;
        let path = write_image(&cache, "ubuntu", b"abc").await;

        let digest = cache.compute_checksum(&path).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let outside = temp.path().join("outside");
        fs::write(&outside, b"secret").await.unwrap();
        assert!(matches!(
            cache.compute_checksum(&outside).await,
            Err(CacheError::PathEscape(_))
        ));

        // Reaching out of the root through dot-dot segments is refused even
        // though the traversal lands on a real file.
        let sneaky = cache.root().join("..").join("outside");
        assert!(cache.compute_checksum(&sneaky).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn permissions_are_restricted() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, cache) = cache().await;
        let path = write_image(&cache, "ubuntu", b"image-bytes").await;
        cache.commit(&path, CHECKSUM_A).await.unwrap();

        let dir_mode = fs::metadata(cache.root()).await.unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o750);

        let sidecar_mode = fs::metadata(sidecar_path(&path))
            .await
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(sidecar_mode & 0o777, 0o600);
    }
}
