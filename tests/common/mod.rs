//! Common test utilities and helper modules
//!
//! Provides scripted relay connections and targets shared by the
//! integration tests.

#![allow(dead_code)]

pub mod mock_relay;

use relay_tunnel::messages::wire;

/// Encoded CONNECT_SUCCESS_SID message
pub fn sid_message(sid: &str) -> Vec<u8> {
    let mut buffer = vec![0u8; wire::DATA_HEADER_LENGTH + sid.len()];
    let n = wire::encode_connect_success_sid(&mut buffer, sid).unwrap();
    buffer.truncate(n);
    buffer
}

/// Encoded RECONNECT_SUCCESS_ACK message
pub fn reconnect_ack_message(ack: u64) -> Vec<u8> {
    let mut buffer = vec![0u8; wire::ACK_MESSAGE_LENGTH];
    wire::encode_reconnect_ack(&mut buffer, ack).unwrap();
    buffer
}

pub fn data_message(payload: &[u8]) -> Vec<u8> {
    wire::data_message(payload).unwrap()
}

pub fn ack_message(ack: u64) -> Vec<u8> {
    wire::ack_message(ack)
}

pub fn long_close_message(code: u32, reason: &str) -> Vec<u8> {
    let mut buffer = vec![0u8; wire::LONG_CLOSE_MIN_LENGTH + reason.len()];
    let n = wire::encode_long_close(&mut buffer, code, reason).unwrap();
    buffer.truncate(n);
    buffer
}

/// Payload of `length` bytes with a recognizable pattern
pub fn payload(length: usize, seed: u8) -> Vec<u8> {
    (0..length).map(|i| seed.wrapping_add(i as u8)).collect()
}
