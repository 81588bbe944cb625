//! A minimal HTTP tracker client: it announces the transfer's progress and
//! learns the addresses of other participants.

use std::{
    fmt,
    fmt::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use serde::de;

use crate::{error::BencodeError, PeerId, Sha1Hash};

pub use reqwest::Error as HttpError;

pub(crate) type Result<T, E = TrackerError> = crate::error::Result<T, E>;

#[derive(Debug)]
#[non_exhaustive]
pub enum TrackerError {
    /// The response is not valid bencode or misses required fields.
    Bencode(BencodeError),
    /// The request could not be sent or the tracker answered with an error
    /// status.
    Http(HttpError),
    /// The tracker refused the announce, with a human readable reason.
    Failure(String),
}

impl From<BencodeError> for TrackerError {
    fn from(e: BencodeError) -> Self {
        Self::Bencode(e)
    }
}

impl From<HttpError> for TrackerError {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "invalid tracker response: {}", e),
            Self::Http(e) => write!(f, "tracker request failed: {}", e),
            Self::Failure(reason) => write!(f, "tracker refused announce: {}", reason),
        }
    }
}

impl std::error::Error for TrackerError {}

/// Everything we tell the tracker in an announce.
#[derive(Clone, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port of our listener.
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    /// The length of the pieces we don't have yet.
    pub left: u64,
    /// How many peers we'd like. The tracker picks if not set.
    pub peer_count: Option<usize>,
    /// Echoes the id of a previous response, if the tracker sent one.
    pub tracker_id: Option<String>,
    pub event: Option<Event>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    /// Sent with the first announce.
    Started,
    /// Sent once when the download completes, but not if we started out
    /// complete.
    Completed,
}

impl Event {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }
}

impl Announce {
    /// Returns the announce query string, without the leading `?`.
    ///
    /// The info hash and peer id are raw bytes, which the usual form encoders
    /// only accept as UTF-8, so the whole query is encoded by hand.
    fn to_query(&self) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode(&self.info_hash, QUERY_ENCODE_SET),
            percent_encode(&self.peer_id, QUERY_ENCODE_SET),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );
        // writing to a string can't fail
        if let Some(peer_count) = self.peer_count {
            let _ = write!(query, "&numwant={}", peer_count);
        }
        if let Some(event) = self.event {
            let _ = write!(query, "&event={}", event.as_str());
        }
        if let Some(tracker_id) = &self.tracker_id {
            let _ = write!(
                query,
                "&trackerid={}",
                percent_encode(tracker_id.as_bytes(), QUERY_ENCODE_SET)
            );
        }
        query
    }
}

/// The bytes that are left as is in the query string.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) struct Response {
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    /// Seconds until the next regular announce.
    interval: Option<u64>,
    /// Seconds before which we must not announce again.
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

impl Response {
    /// Returns how long to wait before the next announce: the tracker's
    /// interval, or the fallback if it didn't send one, but never less than
    /// its minimum interval.
    pub fn next_announce_in(&self, fallback: Duration) -> Duration {
        let interval = self.interval.map(Duration::from_secs).unwrap_or(fallback);
        let min_interval = Duration::from_secs(self.min_interval.unwrap_or(0));
        interval.max(min_interval)
    }
}

pub(crate) struct Tracker {
    http: reqwest::Client,
    url: Url,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    /// Announces our progress and returns the peers the tracker knows of.
    ///
    /// A response carrying a failure reason is turned into
    /// [`TrackerError::Failure`].
    pub async fn announce(&self, params: Announce) -> Result<Response> {
        let mut url = self.url.clone();
        let query = match url.query() {
            Some(existing) => format!("{}&{}", existing, params.to_query()),
            None => params.to_query(),
        };
        url.set_query(Some(&query));
        log::trace!("Announcing to {}", url);

        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let resp: Response = serde_bencode::from_bytes(&body)?;

        if let Some(reason) = resp.failure_reason {
            return Err(TrackerError::Failure(reason));
        }
        if let Some(warning) = &resp.warning_message {
            log::warn!("Tracker {} warning: {}", self, warning);
        }
        Ok(resp)
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}'", self.url)
    }
}

/// The peers of a response are either a compact string of 6 byte entries
/// (IPv4 address and port, both big-endian), or a list of dictionaries with
/// `ip` and `port` keys. Entries whose address doesn't parse are skipped.
fn deserialize_peers<'de, D>(deserializer: D) -> Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct PeersVisitor;

    impl<'de> de::Visitor<'de> for PeersVisitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a compact peer string or a list of peer dictionaries")
        }

        fn visit_bytes<E: de::Error>(self, buf: &[u8]) -> Result<Self::Value, E> {
            const ENTRY_LEN: usize = 6;
            if buf.len() % ENTRY_LEN != 0 {
                return Err(E::invalid_length(buf.len(), &"a multiple of 6 bytes"));
            }
            Ok(buf
                .chunks_exact(ENTRY_LEN)
                .map(|entry| {
                    let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
                    let port = u16::from_be_bytes([entry[4], entry[5]]);
                    SocketAddr::new(IpAddr::V4(ip), port)
                })
                .collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct Entry {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(entry) = seq.next_element::<Entry>()? {
                match entry.ip.parse() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, entry.port)),
                    Err(_) => log::debug!("Skipping tracker peer {:?}", entry.ip),
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeersVisitor)
}

#[cfg(test)]
mod tests {
    use mockito::{mock, Matcher};
    use pretty_assertions::assert_eq;

    use super::*;

    fn compact(peers: &[SocketAddr]) -> Vec<u8> {
        let mut entries = Vec::new();
        for peer in peers {
            if let IpAddr::V4(ip) = peer.ip() {
                entries.extend_from_slice(&ip.octets());
                entries.extend_from_slice(&peer.port().to_be_bytes());
            }
        }
        let mut buf = format!("{}:", entries.len()).into_bytes();
        buf.extend_from_slice(&entries);
        buf
    }

    fn make_announce() -> Announce {
        Announce {
            info_hash: *b"abcdefghij1234567890",
            peer_id: *b"-BS0100-000000000000",
            port: 6881,
            downloaded: 16384,
            uploaded: 0,
            left: 1000,
            peer_count: Some(50),
            tracker_id: None,
            event: Some(Event::Started),
        }
    }

    #[test]
    fn test_compact_peers() {
        let peers: Vec<SocketAddr> = vec![
            "192.168.0.10:49123".parse().unwrap(),
            "10.0.0.1:6881".parse().unwrap(),
        ];
        let mut buf = b"d8:intervali30e5:peers".to_vec();
        buf.extend_from_slice(&compact(&peers));
        buf.push(b'e');

        let resp: Response = serde_bencode::from_bytes(&buf).unwrap();
        assert_eq!(resp.peers, peers);
        assert_eq!(resp.next_announce_in(Duration::from_secs(1)), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_compact_peers() {
        let buf = b"d5:peers5:abcdee";
        assert!(serde_bencode::from_bytes::<Response>(buf).is_err());
    }

    #[test]
    fn test_dictionary_peers() {
        let buf = b"d5:peersl\
            d2:ip12:192.168.1.104:porti55123ee\
            d2:ip9:not an ip4:porti1ee\
            d2:ip9:1.45.96.24:porti1234eee";
        let resp: Response = serde_bencode::from_bytes(&buf[..]).unwrap();
        assert_eq!(
            resp.peers,
            vec![
                "192.168.1.10:55123".parse::<SocketAddr>().unwrap(),
                "1.45.96.2:1234".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_next_announce_respects_min_interval() {
        let resp: Response =
            serde_bencode::from_bytes(b"d8:intervali5e12:min intervali10ee").unwrap();
        assert_eq!(resp.next_announce_in(Duration::from_secs(1)), Duration::from_secs(10));

        let resp: Response = serde_bencode::from_bytes(b"de").unwrap();
        assert!(resp.peers.is_empty());
        assert_eq!(resp.next_announce_in(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn test_query_encodes_raw_bytes() {
        let mut announce = make_announce();
        announce.info_hash = [0xff; 20];
        announce.tracker_id = Some("a b".into());
        let query = announce.to_query();
        assert!(query.starts_with(&format!("info_hash={}&", "%FF".repeat(20))));
        assert!(query.contains("&peer_id=-BS0100-000000000000&"));
        assert!(query.contains("&compact=1"));
        assert!(query.contains("&numwant=50"));
        assert!(query.contains("&event=started"));
        assert!(query.ends_with("&trackerid=a%20b"));
    }

    #[tokio::test]
    async fn test_announce() {
        let tracker = Tracker::new(mockito::server_url().parse().unwrap());
        let announce = make_announce();
        let peer: SocketAddr = "2.156.201.254:49123".parse().unwrap();

        let mut body = b"d8:completei5e10:incompletei3e8:intervali15e5:peers".to_vec();
        body.extend_from_slice(&compact(&[peer]));
        body.extend_from_slice(b"10:tracker id3:xyze");

        let _m = mock("GET", "/")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("info_hash".into(), "abcdefghij1234567890".into()),
                Matcher::UrlEncoded("peer_id".into(), "-BS0100-000000000000".into()),
                Matcher::UrlEncoded("port".into(), "6881".into()),
                Matcher::UrlEncoded("downloaded".into(), "16384".into()),
                Matcher::UrlEncoded("uploaded".into(), "0".into()),
                Matcher::UrlEncoded("left".into(), "1000".into()),
                Matcher::UrlEncoded("compact".into(), "1".into()),
                Matcher::UrlEncoded("numwant".into(), "50".into()),
                Matcher::UrlEncoded("event".into(), "started".into()),
            ]))
            .with_status(200)
            .with_body(body)
            .create();

        let resp = tracker.announce(announce).await.unwrap();
        assert_eq!(resp.peers, vec![peer]);
        assert_eq!(resp.tracker_id.as_deref(), Some("xyz"));
        assert_eq!(resp.next_announce_in(Duration::from_secs(1)), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_announce_failure() {
        let tracker = Tracker::new(mockito::server_url().parse().unwrap());
        let mut announce = make_announce();
        announce.port = 7001;

        let _m = mock("GET", "/")
            .match_query(Matcher::UrlEncoded("port".into(), "7001".into()))
            .with_status(200)
            .with_body(&b"d14:failure reason15:unknown torrente"[..])
            .create();

        match tracker.announce(announce).await {
            Err(TrackerError::Failure(reason)) => assert_eq!(reason, "unknown torrent"),
            res => panic!("expected failure, got {:?}", res),
        }
    }
}
