use sha1::{Digest, Sha1};
use url::Url;

use crate::{
    error::*,
    store::{encode_digest, piece_count, DIGEST_LEN},
    Sha1Hash,
};

/// What a participant needs to know about a transfer before it can
/// exchange a single block.
#[derive(Clone, Debug, PartialEq)]
pub struct Metainfo {
    /// Suggested file name of the content.
    pub name: String,
    /// The tracker's announce URL, if the transfer has one.
    pub announce: Option<Url>,
    /// SHA-1 of the bencoded info dictionary. Identifies the transfer to the
    /// tracker and in handshakes.
    pub info_hash: Sha1Hash,
    /// The raw 20 byte digests of all pieces, concatenated.
    pub pieces: Vec<u8>,
    /// Every piece but the last is exactly this long.
    pub piece_len: u32,
    /// The length of the whole content.
    pub download_len: u64,
    /// Only kept so that the encoded info dictionary hashes to the same info
    /// hash.
    private: Option<u8>,
}

impl Metainfo {
    /// Parses and validates bencoded single-file metainfo.
    ///
    /// Well-formed bencode is rejected too if the piece hashes don't add up
    /// to the content length, or if it describes several files.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw::Metainfo { announce, info } = serde_bencode::from_bytes(buf)?;

        if info.pieces.len() % DIGEST_LEN != 0 {
            return Err(Error::InvalidPieces);
        }
        if info.piece_len == 0 {
            log::warn!("Metainfo piece length must not be zero");
            return Err(Error::InvalidMetainfo);
        }
        if info.files.is_some() {
            log::warn!("Multi-file metainfo is not supported");
            return Err(Error::InvalidMetainfo);
        }
        let download_len = match info.len {
            Some(len) => len,
            None => {
                log::warn!("No `length` key present in metainfo");
                return Err(Error::InvalidMetainfo);
            }
        };
        if info.pieces.len() / DIGEST_LEN != piece_count(info.piece_len, download_len) {
            log::warn!(
                "Metainfo has {} piece hashes for {} bytes",
                info.pieces.len() / DIGEST_LEN,
                download_len
            );
            return Err(Error::InvalidPieces);
        }

        let announce = match announce {
            Some(url) => Some(Url::parse(&url).map_err(|e| {
                log::warn!("Invalid announce URL {}: {}", url, e);
                Error::InvalidMetainfo
            })?),
            None => None,
        };

        let info_hash = info.create_info_hash()?;

        Ok(Self {
            name: info.name,
            announce,
            info_hash,
            pieces: info.pieces,
            piece_len: info.piece_len,
            download_len,
            private: info.private,
        })
    }

    /// Creates the metainfo of the given content, hashing each piece.
    pub fn create(
        name: impl Into<String>,
        content: &[u8],
        piece_len: u32,
        announce: Option<Url>,
    ) -> Result<Self> {
        if piece_len == 0 {
            return Err(Error::InvalidMetainfo);
        }
        let mut pieces = Vec::with_capacity(
            piece_count(piece_len, content.len() as u64) * DIGEST_LEN,
        );
        for piece in content.chunks(piece_len as usize) {
            pieces.extend_from_slice(&Sha1::digest(piece));
        }

        let info = raw::Info {
            name: name.into(),
            pieces,
            piece_len,
            len: Some(content.len() as u64),
            files: None,
            private: None,
        };
        let info_hash = info.create_info_hash()?;

        Ok(Self {
            name: info.name,
            announce,
            info_hash,
            pieces: info.pieces,
            piece_len,
            download_len: content.len() as u64,
            private: None,
        })
    }

    /// Encodes the metainfo into its bencoded form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let metainfo = raw::Metainfo {
            announce: self.announce.as_ref().map(Url::to_string),
            info: raw::Info {
                name: self.name.clone(),
                pieces: self.pieces.clone(),
                piece_len: self.piece_len,
                len: Some(self.download_len),
                files: None,
                private: self.private,
            },
        };
        Ok(serde_bencode::to_bytes(&metainfo)?)
    }

    /// Returns the number of pieces in this transfer.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / DIGEST_LEN
    }

    /// Returns the expected textual digest of each piece, in index order.
    pub fn piece_hashes(&self) -> Vec<String> {
        self.pieces.chunks(DIGEST_LEN).map(encode_digest).collect()
    }
}

/// The bencoded layout, unvalidated.
mod raw {
    use sha1::{Digest, Sha1};

    use super::{Result, Sha1Hash};

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Metainfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub announce: Option<String>,
        pub info: Info,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Info {
        pub name: String,
        #[serde(with = "serde_bytes")]
        pub pieces: Vec<u8>,
        #[serde(rename = "piece length")]
        pub piece_len: u32,
        #[serde(rename = "length", default, skip_serializing_if = "Option::is_none")]
        pub len: Option<u64>,
        /// Only parsed so that multi-file metainfo can be rejected.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub files: Option<Vec<File>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub private: Option<u8>,
    }

    impl Info {
        /// The SHA-1 of the re-encoded dictionary. Field order and the
        /// optional keys must round trip for this to match other clients.
        pub fn create_info_hash(&self) -> Result<Sha1Hash> {
            let encoded = serde_bencode::to_bytes(self)?;
            let mut hash = [0; 20];
            hash.copy_from_slice(&Sha1::digest(&encoded));
            Ok(hash)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct File {
        pub path: Vec<String>,
        #[serde(rename = "length")]
        pub len: u64,
    }
}
