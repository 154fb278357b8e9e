//! Durable gateway state: the parameter list and the cached VCL blob.
//!
//! Both files are rewritten through a temp file and a rename, so a reader
//! never observes a partial write; concurrent writers are last-write-wins.

use std::io;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Content fingerprint of a VCL blob, used as its configuration name.
pub fn vcl_name(body: &[u8]) -> String {
  let mut hasher = Sha1::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

/// Replace any existing entry for `name` and append the new pair.
pub fn add_param(list: &mut Vec<(String, String)>, name: &str, value: &str) {
  list.retain(|(n, _)| n != name);
  list.push((name.to_string(), value.to_string()));
}

pub struct StateStore {
  params_path: PathBuf,
  vcl_path: PathBuf,
}

impl StateStore {
  pub fn new(params_path: impl Into<PathBuf>, vcl_path: impl Into<PathBuf>) -> Self {
    Self {
      params_path: params_path.into(),
      vcl_path: vcl_path.into(),
    }
  }

  /// Read the parameter list. A missing or unreadable file is an empty
  /// list; lines that do not look like `name=value` are skipped.
  pub async fn load_params(&self) -> Vec<(String, String)> {
    let content = match fs::read_to_string(&self.params_path).await {
      Ok(c) => c,
      Err(e) => {
        if e.kind() != io::ErrorKind::NotFound {
          tracing::warn!(
            "could not read {}: {}",
            self.params_path.display(),
            e
          );
        }
        return Vec::new();
      }
    };

    let mut list = Vec::new();
    for line in content.lines() {
      if line.is_empty() {
        continue;
      }
      let Some((name, value)) = line.split_once('=') else {
        continue;
      };
      if name.is_empty() || name.contains(char::is_whitespace) {
        continue;
      }
      add_param(&mut list, name, value);
    }
    list
  }

  /// Rewrite the parameter file from a full list.
  pub async fn save_params(&self, list: &[(String, String)]) -> io::Result<()> {
    let mut out = String::new();
    for (name, value) in list {
      out.push_str(name);
      out.push('=');
      out.push_str(value);
      out.push('\n');
    }
    write_atomic(&self.params_path, out.as_bytes()).await
  }

  /// Record one parameter: read the current list, dedup, append, rewrite.
  pub async fn set_param(&self, name: &str, value: &str) -> io::Result<()> {
    let mut list = self.load_params().await;
    add_param(&mut list, name, value);
    self.save_params(&list).await
  }

  /// Read the VCL blob; `None` when no usable file exists.
  pub async fn load_vcl(&self) -> Option<Vec<u8>> {
    match fs::read(&self.vcl_path).await {
      Ok(body) => Some(body),
      Err(e) => {
        if e.kind() != io::ErrorKind::NotFound {
          tracing::warn!("could not read {}: {}", self.vcl_path.display(), e);
        }
        None
      }
    }
  }

  /// Overwrite the VCL blob.
  pub async fn save_vcl(&self, body: &[u8]) -> io::Result<()> {
    write_atomic(&self.vcl_path, body).await
  }
}

async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      fs::create_dir_all(parent).await?;
    }
  }

  let mut temp_os = path.as_os_str().to_owned();
  temp_os.push(".tmp");
  let temp_path = PathBuf::from(temp_os);
  let mut file = File::create(&temp_path).await?;
  file.write_all(data).await?;
  file.sync_all().await?;
  drop(file);

  fs::rename(&temp_path, path).await
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store(dir: &tempfile::TempDir) -> StateStore {
    StateStore::new(dir.path().join("agent.params"), dir.path().join("agent.vcl"))
  }

  #[test]
  fn test_add_param_dedups_and_appends() {
    let mut list = Vec::new();
    add_param(&mut list, "x", "1");
    add_param(&mut list, "y", "2");
    add_param(&mut list, "x", "2");
    assert_eq!(
      list,
      vec![
        ("y".to_string(), "2".to_string()),
        ("x".to_string(), "2".to_string()),
      ]
    );
  }

  #[tokio::test]
  async fn test_params_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    store.set_param("thread_pool_min", "5").await.unwrap();
    store.set_param("first_byte_timeout", "60").await.unwrap();
    store.set_param("thread_pool_min", "10").await.unwrap();

    let list = store.load_params().await;
    assert_eq!(
      list,
      vec![
        ("first_byte_timeout".to_string(), "60".to_string()),
        ("thread_pool_min".to_string(), "10".to_string()),
      ]
    );

    // write(read(F)) leaves the file unchanged
    let before = std::fs::read_to_string(dir.path().join("agent.params")).unwrap();
    store.save_params(&list).await.unwrap();
    let after = std::fs::read_to_string(dir.path().join("agent.params")).unwrap();
    assert_eq!(before, after);
  }

  #[tokio::test]
  async fn test_load_params_skips_junk_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.params");
    std::fs::write(&path, "x=1\n\nnot a pair\nbad name=2\n=3\ny=a=b\n").unwrap();

    let store = StateStore::new(&path, dir.path().join("agent.vcl"));
    let list = store.load_params().await;
    assert_eq!(
      list,
      vec![
        ("x".to_string(), "1".to_string()),
        ("y".to_string(), "a=b".to_string()),
      ]
    );
  }

  #[tokio::test]
  async fn test_missing_files_read_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    assert!(store.load_params().await.is_empty());
    assert!(store.load_vcl().await.is_none());
  }

  #[tokio::test]
  async fn test_vcl_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    store.save_vcl(b"vcl 4.0;\n").await.unwrap();
    store.save_vcl(b"vcl 4.1;\n").await.unwrap();
    assert_eq!(store.load_vcl().await.unwrap(), b"vcl 4.1;\n");
  }

  #[test]
  fn test_vcl_name_is_stable_sha1() {
    let body = b"vcl 4.0;\nbackend default { .host = \"127.0.0.1\"; }\n";
    assert_eq!(vcl_name(body), vcl_name(body));
    assert_eq!(vcl_name(body).len(), 40);
    assert_ne!(vcl_name(body), vcl_name(b"vcl 4.0;\n"));
    // Known vector
    assert_eq!(
      vcl_name(b"abc"),
      "a9993e364706816aba3e25717850c26c9cd0d89d"
    );
  }
}
