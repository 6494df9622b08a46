use crate::base::neterror::NetError;
use std::io;

#[test]
fn test_net_error_codes() {
    assert_eq!(NetError::ConnectionRefused.as_i32(), -102);
    assert_eq!(NetError::SocketClosed.as_i32(), -112);
    assert_eq!(NetError::PendingRead.as_i32(), -1000);
}

#[test]
fn test_classification() {
    assert!(NetError::PendingAccept.is_usage_fault());
    assert!(NetError::UnknownSocket(7).is_usage_fault());
    assert!(NetError::PendingCrypto.is_usage_fault());
    assert!(!NetError::ConnectionRefused.is_usage_fault());

    assert!(NetError::CryptoPeerReset.is_crypto_fault());
    assert!(NetError::CryptoNegotiation("bad".into()).is_crypto_fault());

    assert!(NetError::Cancelled.is_cancellation());
    assert!(!NetError::Cancelled.is_usage_fault());
}

#[test]
fn test_from_io_error() {
    let err = NetError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
    assert!(matches!(err, NetError::ConnectionRefused));

    let err = NetError::from(io::Error::from(io::ErrorKind::PermissionDenied));
    match err {
        NetError::Io(source) => assert_eq!(source.kind(), io::ErrorKind::PermissionDenied),
        other => panic!("Expected Io, got {other:?}"),
    }
}

#[test]
fn test_usage_fault_codes_do_not_collide() {
    // Custom usage-fault codes live outside Chromium's reserved ranges.
    let chromium_range = -999..=-100;
    for err in [
        NetError::PendingRead,
        NetError::PendingAccept,
        NetError::PendingReceive,
        NetError::EndpointNotWritable,
        NetError::UnknownSocket(1),
        NetError::PendingCrypto,
    ] {
        assert!(!chromium_range.contains(&err.as_i32()));
    }
}
