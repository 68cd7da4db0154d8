// SPDX-License-Identifier: Apache-2.0

//! The wire shape of one proposed consensus batch: a list of client requests, encoded
//! with the same `bcs` format `ubft-rpc` uses for its own client-facing messages.

use ubft_rpc::ClientRequest;

pub fn encode_batch(requests: &[ClientRequest]) -> Vec<u8> {
    bcs::to_bytes(requests).expect("bcs encoding never fails")
}

pub fn decode_batch(bytes: &[u8]) -> Option<Vec<ClientRequest>> {
    bcs::from_bytes(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_round_trip() {
        let requests = vec![
            ClientRequest { client_id: 1, request_id: 0, payload: b"a".to_vec() },
            ClientRequest { client_id: 2, request_id: 0, payload: b"b".to_vec() },
        ];
        let encoded = encode_batch(&requests);
        assert_eq!(decode_batch(&encoded), Some(requests));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert_eq!(decode_batch(&[0xff, 0x00, 0x01]), None);
    }
}
