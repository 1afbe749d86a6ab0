use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{MapError, Result};
use crate::scheduler::MapId;

const MAX_TAG_LEN: usize = 128;

/// Tags name map directories' tag files, so they must be safe file names.
pub fn raise_if_tag_is_invalid(tag: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(MapError::InvalidTag {
            tag: tag.to_string(),
            reason: reason.to_string(),
        })
    };

    if tag.is_empty() {
        return invalid("tag must not be empty");
    }
    if tag.len() > MAX_TAG_LEN {
        return invalid("tag is longer than 128 characters");
    }
    if tag.starts_with('.') {
        return invalid("tag must not start with '.'");
    }
    if let Some(c) = tag
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return invalid(&format!("character {:?} is not allowed", c));
    }
    Ok(())
}

/// Path of the file that points `tag` at its map.
pub fn tag_file_path(tags_dir: &Path, tag: &str) -> PathBuf {
    tags_dir.join(tag)
}

pub fn raise_if_tag_already_exists(tags_dir: &Path, tag: &str) -> Result<()> {
    if tag_file_path(tags_dir, tag).exists() {
        return Err(MapError::TagAlreadyExists(tag.to_string()));
    }
    Ok(())
}

/// Create the tag file for `tag` pointing at `id`. Fails with
/// [`MapError::TagAlreadyExists`] if another map holds the tag, even if it
/// was created after [`raise_if_tag_already_exists`] passed.
pub async fn claim_tag(tags_dir: &Path, tag: &str, id: &MapId) -> Result<()> {
    let path = tag_file_path(tags_dir, tag);
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(MapError::TagAlreadyExists(tag.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(id.to_string().as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// A fresh tag for a map submitted without one.
pub fn random_tag(tags_dir: &Path) -> String {
    loop {
        let uuid = Uuid::new_v4().simple().to_string();
        let tag = format!("map-{}", &uuid[..8]);
        if !tag_file_path(tags_dir, &tag).exists() {
            return tag;
        }
    }
}

/// All tags with a tag file, sorted.
pub async fn list_tags(tags_dir: &Path) -> Result<Vec<String>> {
    let mut tags = Vec::new();
    let mut entries = match tokio::fs::read_dir(tags_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tags),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            tags.push(name.to_string());
        }
    }
    tags.sort();
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_tags() {
        for tag in ["sleepy", "run-1", "a.b_c", "X9"] {
            assert!(raise_if_tag_is_invalid(tag).is_ok(), "{}", tag);
        }
    }

    #[test]
    fn invalid_tags() {
        let long = "a".repeat(129);
        for tag in ["", ".hidden", "a/b", "has space", "tab\t", long.as_str()] {
            assert!(
                matches!(raise_if_tag_is_invalid(tag), Err(MapError::InvalidTag { .. })),
                "{:?}",
                tag
            );
        }
    }

    #[tokio::test]
    async fn random_tags_avoid_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let tag = random_tag(tmp.path());
        assert!(tag.starts_with("map-"));
        assert_eq!(tag.len(), 12);
        assert!(raise_if_tag_is_invalid(&tag).is_ok());

        tokio::fs::write(tmp.path().join(&tag), b"id").await.unwrap();
        assert!(matches!(
            raise_if_tag_already_exists(tmp.path(), &tag),
            Err(MapError::TagAlreadyExists(_))
        ));
        assert_eq!(list_tags(tmp.path()).await.unwrap(), vec![tag]);
    }

    #[tokio::test]
    async fn claiming_a_tag_twice_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let first = MapId::new();

        claim_tag(tmp.path(), "taken", &first).await.unwrap();
        assert!(matches!(
            claim_tag(tmp.path(), "taken", &MapId::new()).await,
            Err(MapError::TagAlreadyExists(tag)) if tag == "taken"
        ));

        let contents = tokio::fs::read_to_string(tmp.path().join("taken")).await.unwrap();
        assert_eq!(contents, first.to_string());
    }
}
