use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_bencode::value::Value;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::torrent::{HASH_LEN, Torrent};

/// Total deadline for the announce round-trip.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// One-shot HTTP announce client.
///
/// A single GET per download attempt; there is no periodic re-announce.
pub struct Tracker {
    client: Client,
}

/// Decoded announce response. Only the peer list is acted on; the
/// suggested re-announce interval is surfaced for logging.
#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    #[serde(rename = "peers")]
    peers_data: Value,
    pub interval: Option<i64>,
}

impl Tracker {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(Error::TrackerUnreachable)?;
        Ok(Self { client })
    }

    /// Announces to the torrent's tracker and returns the parsed response.
    pub async fn announce(
        &self,
        torrent: &Torrent,
        peer_id: &[u8; HASH_LEN],
        port: u16,
    ) -> Result<AnnounceResponse> {
        let base = Url::parse(&torrent.announce)
            .map_err(|e| Error::Metadata(format!("announce url: {e}")))?;

        // info_hash and peer_id are raw bytes, not UTF-8; they must be
        // percent-encoded by hand rather than through a string query API.
        let query = format!(
            "info_hash={}&peer_id={}&port={port}&uploaded=0&downloaded=0&left={}&compact=1",
            encode_bytes(&torrent.info_hash()),
            encode_bytes(peer_id),
            torrent.total_size(),
        );
        let url = match base.query() {
            Some(_) => format!("{base}&{query}"),
            None => format!("{base}?{query}"),
        };
        debug!(%url, "announcing");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Error::TrackerUnreachable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::TrackerStatus(status.as_u16()));
        }
        let body = response.bytes().await.map_err(Error::TrackerUnreachable)?;

        serde_bencode::from_bytes(&body).map_err(|e| Error::TrackerResponse(e.to_string()))
    }
}

impl AnnounceResponse {
    /// Extracts the peer list from either wire form: a byte string of
    /// packed 6-byte records (compact) or a list of dictionaries with
    /// `ip` and `port` entries. Any other shape is malformed.
    pub fn peers(&self) -> Result<Vec<Peer>> {
        match &self.peers_data {
            Value::Bytes(data) => {
                if data.len() % 6 != 0 {
                    return Err(Error::TrackerResponse(format!(
                        "compact peer list of {} bytes is not a multiple of 6",
                        data.len()
                    )));
                }
                Ok(data
                    .chunks_exact(6)
                    .map(|record| Peer {
                        ip: IpAddr::V4(Ipv4Addr::new(record[0], record[1], record[2], record[3])),
                        port: u16::from_be_bytes([record[4], record[5]]),
                    })
                    .collect())
            }
            Value::List(entries) => entries.iter().map(dict_peer).collect(),
            _ => Err(Error::TrackerResponse(
                "peers field is neither a byte string nor a list".into(),
            )),
        }
    }
}

fn dict_peer(entry: &Value) -> Result<Peer> {
    let Value::Dict(dict) = entry else {
        return Err(Error::TrackerResponse(
            "non-compact peer entry is not a dictionary".into(),
        ));
    };

    let ip = dict
        .get(&b"ip".to_vec())
        .and_then(|v| match v {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        })
        .and_then(|s| s.parse::<IpAddr>().ok())
        .ok_or_else(|| Error::TrackerResponse("peer entry lacks a usable ip".into()))?;

    let port = dict
        .get(&b"port".to_vec())
        .and_then(|v| match v {
            Value::Int(n) => u16::try_from(*n).ok(),
            _ => None,
        })
        .ok_or_else(|| Error::TrackerResponse("peer entry lacks a usable port".into()))?;

    Ok(Peer { ip, port })
}

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

/// Fresh 20-byte client identifier in the conventional Azureus style:
/// a fixed client prefix followed by random digits, regenerated per run.
pub fn generate_peer_id() -> [u8; HASH_LEN] {
    let mut id = *b"-LE0001-000000000000";
    let mut rng = rand::rng();
    for byte in id[8..].iter_mut() {
        *byte = rng.random_range(b'0'..=b'9');
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_record_parses_to_address() {
        let response: AnnounceResponse =
            serde_bencode::from_bytes(b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e")
                .unwrap();

        let peers = response.peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(response.interval, Some(1800));
    }

    #[test]
    fn compact_list_parses_multiple_records() {
        let response: AnnounceResponse = serde_bencode::from_bytes(
            b"d5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x00\x50e",
        )
        .unwrap();

        let peers = response.peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(peers[1].port, 80);
    }

    #[test]
    fn ragged_compact_list_is_malformed() {
        let response: AnnounceResponse =
            serde_bencode::from_bytes(b"d5:peers5:\x7f\x00\x00\x01\x1ae").unwrap();
        assert!(matches!(
            response.peers(),
            Err(Error::TrackerResponse(_))
        ));
    }

    #[test]
    fn non_compact_dictionaries_parse() {
        let response: AnnounceResponse =
            serde_bencode::from_bytes(b"d5:peersld2:ip9:127.0.0.14:porti6881eeee").unwrap();

        let peers = response.peers().unwrap();
        assert_eq!(peers, vec![Peer {
            ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 6881,
        }]);
    }

    #[test]
    fn out_of_range_port_is_malformed() {
        let response: AnnounceResponse =
            serde_bencode::from_bytes(b"d5:peersld2:ip9:127.0.0.14:porti70000eeee").unwrap();
        assert!(response.peers().is_err());
    }

    #[test]
    fn unexpected_peers_shape_is_malformed() {
        let response: AnnounceResponse = serde_bencode::from_bytes(b"d5:peersi0ee").unwrap();
        assert!(matches!(
            response.peers(),
            Err(Error::TrackerResponse(_))
        ));
    }

    #[test]
    fn missing_peers_field_fails_to_decode() {
        let result: std::result::Result<AnnounceResponse, _> =
            serde_bencode::from_bytes(b"d8:intervali1800ee");
        assert!(result.is_err());
    }

    #[test]
    fn peer_id_has_client_prefix_and_digits() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-LE0001-");
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn raw_bytes_are_fully_percent_encoded() {
        assert_eq!(encode_bytes(&[0x7f, 0x00, 0xff]), "%7F%00%FF");
    }
}
