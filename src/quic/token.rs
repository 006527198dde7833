//! Stateless address validation tokens for QUIC `Retry`.
//!
//! ```text
//! b"quiche" | peer ip octets | peer port (big-endian) | original dcid
//! ```

use quiche::ConnectionId;
use std::net::{IpAddr, SocketAddr};

const MAGIC: &[u8] = b"quiche";

fn address_bytes(peer: &SocketAddr) -> Vec<u8> {
    let mut bytes = match peer.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    bytes.extend_from_slice(&peer.port().to_be_bytes());
    bytes
}

/// Token sent with a `Retry` to `peer`, carrying the client's first dcid.
pub(crate) fn mint_token(dcid: &[u8], peer: &SocketAddr) -> Vec<u8> {
    let address = address_bytes(peer);

    let mut token = Vec::with_capacity(MAGIC.len() + address.len() + dcid.len());
    token.extend_from_slice(MAGIC);
    token.extend_from_slice(&address);
    token.extend_from_slice(dcid);
    token
}

/// The original dcid inside `token`, if it was minted for `peer`.
pub(crate) fn validate_token<'t>(token: &'t [u8], peer: &SocketAddr) -> Option<ConnectionId<'t>> {
    let rest = token.strip_prefix(MAGIC)?;
    let odcid = rest.strip_prefix(address_bytes(peer).as_slice())?;

    match odcid.len() <= quiche::MAX_CONN_ID_LEN {
        true => Some(ConnectionId::from_ref(odcid)),
        false => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        #[rustfmt::skip]
        let cases = [
            ("127.0.0.1:4433",       &b"\x01\x02\x03\x04\x05\x06\x07\x08"[..]),
            ("[::1]:443",            &b"0123456789abcdef"[..]),
            ("192.168.10.20:65535",  &b""[..]),
        ];

        for (peer, dcid) in cases {
            let peer: SocketAddr = peer.parse().unwrap();
            let token = mint_token(dcid, &peer);

            assert!(token.starts_with(b"quiche"));
            let odcid = validate_token(&token, &peer).unwrap();
            assert_eq!(&odcid[..], dcid, "{peer}");
        }
    }

    #[test]
    fn layout() {
        let peer: SocketAddr = "10.0.0.1:258".parse().unwrap();
        assert_eq!(mint_token(b"ab", &peer), b"quiche\x0a\x00\x00\x01\x01\x02ab");
    }

    #[test]
    fn any_mutation_is_rejected() {
        let peer: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let token = mint_token(b"\xaa\xbb\xcc\xdd", &peer);

        // Every byte of the magic and of the address is checked
        for i in 0..token.len() - 4 {
            let mut bad = token.clone();
            bad[i] ^= 0x01;
            assert!(validate_token(&bad, &peer).is_none(), "byte {i}");
        }

        let other: SocketAddr = "127.0.0.1:4434".parse().unwrap();
        assert!(validate_token(&token, &other).is_none());
        assert!(validate_token(b"quic", &peer).is_none());
        assert!(validate_token(b"", &peer).is_none());
    }

    #[test]
    fn oversized_odcid() {
        let peer: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let token = mint_token(&[7; quiche::MAX_CONN_ID_LEN + 1], &peer);
        assert!(validate_token(&token, &peer).is_none());
    }
}
