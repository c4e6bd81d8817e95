use std::path::PathBuf;

use serde_bencode::Error;
use sha1::{Digest, Sha1};

use crate::{
    storage_info::{FileAttrs, FileInfo, FileStorage},
    Sha1Hash,
};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        serde_bencode::from_bytes(buf)
    }

    pub fn create_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The concatenation of all expected piece hashes, 20 bytes each.
    pub fn piece_hashes(&self) -> &[u8] {
        &self.info.pieces
    }

    /// Builds the storage manifest described by the metainfo.
    ///
    /// Single file torrents become a one entry manifest named after the
    /// torrent. Multi-file torrents keep their relative paths; the caller is
    /// expected to root them under a directory named after the torrent.
    /// Files whose `attr` string contains `'p'` (BEP 47) become pad files.
    pub fn storage(&self) -> crate::error::Result<FileStorage> {
        let files = if let Some(files) = &self.info.files {
            let mut entries = Vec::with_capacity(files.len());
            let mut torrent_offset = 0;
            for file in files.iter() {
                let len = file.length.max(0) as u64;
                let attr = file.attr.as_deref().unwrap_or("");
                let mut info = if attr.contains('p') {
                    FileInfo::pad(len, torrent_offset)
                } else {
                    let path: PathBuf = file.path.iter().collect();
                    FileInfo::new(path, len, torrent_offset)
                };
                info.attrs = FileAttrs {
                    executable: attr.contains('x'),
                    hidden: attr.contains('h'),
                    symlink: file
                        .symlink_path
                        .as_ref()
                        .map(|p| p.iter().collect()),
                };
                torrent_offset += len;
                entries.push(info);
            }
            entries
        } else {
            let len = self.info.length.unwrap_or(0);
            vec![FileInfo::new(&self.info.name, len, 0)]
        };

        FileStorage::new(
            &self.info.name,
            files,
            self.info.piece_length as u32,
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
    /// BEP 47 attribute string: any of "phxl" (pad, hidden, executable,
    /// symlink).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,
    #[serde(
        rename = "symlink path",
        skip_serializing_if = "Option::is_none"
    )]
    pub symlink_path: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    fn metainfo(info: Info) -> Metainfo {
        Metainfo { info }
    }

    #[test]
    fn test_single_file_storage() {
        let m = metainfo(Info {
            name: "single".into(),
            pieces: vec![0; 20],
            piece_length: BLOCK_LEN as u64,
            length: Some(10_000),
            files: None,
            private: None,
        });
        let fs = m.storage().unwrap();
        assert_eq!(fs.num_files(), 1);
        assert_eq!(fs.file(0).path, PathBuf::from("single"));
        assert_eq!(fs.total_len(), 10_000);
        assert_eq!(fs.piece_count(), 1);
    }

    #[test]
    fn test_multi_file_storage_with_pad() {
        let m = metainfo(Info {
            name: "multi".into(),
            pieces: vec![0; 40],
            piece_length: BLOCK_LEN as u64,
            length: None,
            files: Some(vec![
                File {
                    path: vec!["dir".into(), "a".into()],
                    length: 10_000,
                    attr: None,
                    symlink_path: None,
                },
                File {
                    path: vec![".pad".into(), "6384".into()],
                    length: (BLOCK_LEN - 10_000) as i64,
                    attr: Some("p".into()),
                    symlink_path: None,
                },
                File {
                    path: vec!["b".into()],
                    length: BLOCK_LEN as i64,
                    attr: Some("x".into()),
                    symlink_path: None,
                },
            ]),
            private: None,
        });
        let fs = m.storage().unwrap();
        assert_eq!(fs.num_files(), 3);
        assert_eq!(fs.file(0).path, PathBuf::from("dir/a"));
        assert!(fs.file(1).pad_file);
        assert!(fs.file(2).attrs.executable);
        assert_eq!(fs.file(2).torrent_offset, BLOCK_LEN as u64);
        assert_eq!(fs.piece_count(), 2);
    }
}
