mod common;

use common::{buffers, code, handle, le16, run_pair, run_single, settle, Wire, PSM};
use trouble_l2cap::{
    ChannelKind, ChannelState, Error, L2capChannel, L2capChannelConfig, L2capHostError, LeCreditConnResultCode, Qos,
    RxMode, SduSource,
};
use trouble_l2cap::config::L2CAP_RX_QUEUE_SIZE;

const PEER_CID: u16 = 0x0040;

fn le_config() -> L2capChannelConfig {
    L2capChannelConfig {
        mtu: Some(100),
        mps: Some(23),
        ..Default::default()
    }
}

fn enhanced_config() -> L2capChannelConfig {
    L2capChannelConfig {
        mtu: Some(100),
        mps: Some(64),
        ..Default::default()
    }
}

fn is_host_error<E>(result: &Result<impl Sized, L2capHostError<E>>, expected: Error) -> bool {
    matches!(result, Err(L2capHostError::Host(e)) if *e == expected)
}

// Produces an SDU of `len` bytes counting up from zero.
struct Counter {
    len: usize,
    calls: usize,
}

impl SduSource for Counter {
    fn len(&self) -> usize {
        self.len
    }

    fn fill(&mut self, offset: usize, buf: &mut [u8]) {
        self.calls += 1;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (offset + i) as u8;
        }
    }
}

#[tokio::test]
async fn sdu_round_trip() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let a = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let b = common::host::<2, 8, 128>(&wire, 1, Qos::None);
    wire.link_up(handle());

    run_pair(&a, &b, async {
        let (ca, cb) = tokio::join!(a.accept(), b.accept());
        let config = le_config();
        let (tx, rx) = tokio::join!(
            L2capChannel::create(&a, &ca, PSM, &config),
            L2capChannel::accept(&b, &cb, &[PSM], &config)
        );
        let mut tx = tx.unwrap();
        let mut rx = rx.unwrap();
        assert_eq!(tx.state(), ChannelState::Connected);
        assert_eq!(tx.kind(), ChannelKind::Le);
        assert_eq!(tx.peer_cid(), rx.local_cid());
        assert_eq!(rx.peer_cid(), tx.local_cid());
        assert_eq!(tx.peer_mps(), 23);
        assert_eq!(rx.psm(), PSM);

        let send = async {
            for i in 0..10u8 {
                tx.send(&a, &[i; 100]).await.unwrap();
            }
            let mut source = Counter { len: 90, calls: 0 };
            tx.send_with(&a, &mut source).await.unwrap();
            assert_eq!(source.calls, 4);
        };
        let recv = async {
            let mut buf = [0; 100];
            for i in 0..10u8 {
                let len = rx.receive(&b, &mut buf).await.unwrap();
                assert_eq!(len, 100);
                assert_eq!(buf, [i; 100]);
            }
            let len = rx.receive(&b, &mut buf).await.unwrap();
            assert_eq!(len, 90);
            assert!(buf[..90].iter().enumerate().all(|(i, b)| *b == i as u8));
        };
        tokio::join!(send, recv);

        // Replies travel the other way on the same channel.
        let (sent, received) = tokio::join!(rx.send(&b, b"pong"), async {
            let mut buf = [0; 16];
            tx.receive(&a, &mut buf).await.map(|len| buf[..len].to_vec())
        });
        sent.unwrap();
        assert_eq!(received.unwrap(), b"pong");

        settle().await;
        assert_eq!(tx.tx_credits(), rx.rx_credits());
        assert_eq!(rx.tx_credits(), tx.rx_credits());
    })
    .await;

    for side in 0..2 {
        assert!(wire.written(side).iter().all(|f| f.data.len() <= 27));
    }
}

#[tokio::test]
async fn small_receive_buffer_discards_sdu() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let a = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let b = common::host::<2, 8, 128>(&wire, 1, Qos::None);
    wire.link_up(handle());

    run_pair(&a, &b, async {
        let (ca, cb) = tokio::join!(a.accept(), b.accept());
        let config = le_config();
        let (tx, rx) = tokio::join!(
            L2capChannel::create(&a, &ca, PSM, &config),
            L2capChannel::accept(&b, &cb, &[PSM], &config)
        );
        let mut tx = tx.unwrap();
        let mut rx = rx.unwrap();

        tx.send(&a, &[1; 40]).await.unwrap();
        tx.send(&a, &[2; 8]).await.unwrap();
        let mut buf = [0; 10];
        let result = rx.receive(&b, &mut buf).await;
        assert!(is_host_error(&result, Error::InsufficientSpace));
        assert_eq!(rx.receive(&b, &mut buf).await.unwrap(), 8);
        assert_eq!(buf[..8], [2; 8]);
        assert_eq!(rx.state(), ChannelState::Connected);

        let result = tx.send(&a, &[0; 101]).await;
        assert!(is_host_error(&result, Error::InsufficientSpace));
    })
    .await;
}

#[tokio::test]
async fn credits_gate_segments() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let conn = host.accept().await;
        let le_cfg = le_config();
        let (ch, ()) = tokio::join!(L2capChannel::create(&host, &conn, PSM, &le_cfg), async {
            let req = peer.signal().await;
            assert_eq!(req.code, code::LE_CONN_REQ);
            assert_eq!(req.u16(0), PSM);
            peer.send_signal(code::LE_CONN_RES, req.ident, &le16(&[PEER_CID, 100, 23, 1, 0]));
        });
        let mut ch = ch.unwrap();
        assert_eq!(ch.tx_credits(), 1);

        let sdu: Vec<u8> = (0..60).collect();
        let (sent, ()) = tokio::join!(ch.send(&host, &sdu), async {
            let (cid, first) = peer.pdu().await;
            assert_eq!(cid, PEER_CID);
            assert_eq!(first.len(), 23);
            assert_eq!(first[..2], [60, 0]);
            assert_eq!(first[2..], sdu[..21]);
            settle().await;
            assert_eq!(peer.pending_frames(), 0);

            peer.send_signal(code::FLOW_IND, 2, &le16(&[PEER_CID, 1]));
            let (_, second) = peer.pdu().await;
            assert_eq!(second[..], sdu[21..44]);
            settle().await;
            assert_eq!(peer.pending_frames(), 0);

            peer.send_signal(code::FLOW_IND, 3, &le16(&[PEER_CID, 1]));
            let (_, third) = peer.pdu().await;
            assert_eq!(third[..], sdu[44..]);
        });
        sent.unwrap();
        assert_eq!(ch.tx_credits(), 0);
    })
    .await;
}

#[tokio::test]
async fn send_waiting_for_credits_fails_on_disconnect() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let conn = host.accept().await;
        let le_cfg = le_config();
        let (ch, ()) = tokio::join!(L2capChannel::create(&host, &conn, PSM, &le_cfg), async {
            let req = peer.signal().await;
            peer.send_signal(code::LE_CONN_RES, req.ident, &le16(&[PEER_CID, 100, 23, 1, 0]));
        });
        let mut ch = ch.unwrap();
        let local = ch.local_cid();

        let (sent, ()) = tokio::join!(ch.send(&host, &[7; 60]), async {
            let (cid, _) = peer.pdu().await;
            assert_eq!(cid, PEER_CID);
            peer.send_signal(code::DISCONNECTION_REQ, 4, &le16(&[local, PEER_CID]));
            let res = peer.signal().await;
            assert_eq!(res.code, code::DISCONNECTION_RES);
            assert_eq!(res.ident, 4);
            assert_eq!(res.u16(0), local);
            assert_eq!(res.u16(2), PEER_CID);
        });
        assert!(is_host_error(&sent, Error::Disconnected));
        assert_eq!(ch.state(), ChannelState::Disconnected);

        // Nothing more goes out for the closed channel.
        settle().await;
        assert_eq!(peer.pending_frames(), 0);
    })
    .await;
}

#[tokio::test]
async fn blocked_sender_does_not_stall_receive() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 2, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());
    let send_only = L2capChannelConfig {
        initial_credits: Some(0),
        ..le_config()
    };

    run_single(&host, async {
        let conn = host.accept().await;
        let (x, ()) = tokio::join!(L2capChannel::create(&host, &conn, PSM, &send_only), async {
            let req = peer.signal().await;
            assert_eq!(req.u16(8), 0);
            peer.send_signal(code::LE_CONN_RES, req.ident, &le16(&[PEER_CID, 100, 23, 1, 0]));
        });
        let mut x = x.unwrap();

        let sdu: Vec<u8> = (0..60).collect();
        let le_cfg = le_config();
        let (sent, y, ()) = tokio::join!(
            x.send(&host, &sdu),
            L2capChannel::accept(&host, &conn, &[PSM], &le_cfg),
            async {
                // The first segment leaves, the rest waits for credits while holding a packet.
                let (cid, first) = peer.pdu().await;
                assert_eq!(cid, PEER_CID);
                assert_eq!(first[2..], sdu[..21]);

                peer.send_signal(code::LE_CONN_REQ, 2, &le16(&[PSM, PEER_CID + 1, 100, 23, 10]));
                let res = peer.signal().await;
                assert_eq!(res.code, code::LE_CONN_RES);
                assert_eq!(res.u16(8), 0);
                // Only the packet the sender does not hold can back a credit.
                assert_eq!(res.u16(6), 1);
                let y_cid = res.u16(0);

                peer.send_sdu(y_cid, b"one", 23);
                peer.send_sdu(y_cid, b"two", 23);
                peer.send_signal(code::FLOW_IND, 3, &le16(&[PEER_CID, 2]));

                let mut rest = Vec::new();
                let mut disconnect = None;
                while rest.len() < 2 || disconnect.is_none() {
                    let (cid, payload) = peer.pdu().await;
                    if cid == PEER_CID {
                        rest.push(payload);
                    } else {
                        assert_eq!(cid, common::SIGNAL_CID);
                        assert_eq!(payload[0], code::DISCONNECTION_REQ);
                        disconnect = Some(payload);
                    }
                }
                assert_eq!(rest[0][..], sdu[21..44]);
                assert_eq!(rest[1][..], sdu[44..]);

                // The channel that overran its credits is closed.
                let req = disconnect.unwrap();
                let dcid = u16::from_le_bytes([req[4], req[5]]);
                let scid = u16::from_le_bytes([req[6], req[7]]);
                assert_eq!(dcid, PEER_CID + 1);
                assert_eq!(scid, y_cid);
                peer.send_signal(code::DISCONNECTION_RES, req[1], &le16(&[dcid, scid]));
            }
        );
        sent.unwrap();
        let y = y.unwrap();
        settle().await;
        assert_eq!(y.state(), ChannelState::Disconnected);
        assert_eq!(x.state(), ChannelState::Connected);
        assert_eq!(x.tx_credits(), 0);
    })
    .await;
}

#[tokio::test]
async fn truncated_pdu_closes_only_its_channel() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let conn = host.accept().await;
        peer.send_signal(code::LE_CONN_REQ, 1, &le16(&[PSM, PEER_CID, 100, 64, 10]));
        let mut y = L2capChannel::accept(&host, &conn, &[PSM], &enhanced_config()).await.unwrap();
        let y_cid = peer.signal().await.u16(0);
        peer.send_signal(code::LE_CONN_REQ, 2, &le16(&[PSM, PEER_CID + 1, 100, 64, 10]));
        let mut z = L2capChannel::accept(&host, &conn, &[PSM], &enhanced_config()).await.unwrap();
        let z_cid = peer.signal().await.u16(0);

        // A PDU of 40 bytes that stops after 16, then a new PDU on the other channel.
        let mut partial = le16(&[40, y_cid, 38]);
        partial.extend_from_slice(&[1; 14]);
        peer.send_frame(true, &partial);
        peer.send_sdu(z_cid, b"hello", 64);

        let sdu = z.receive_sdu(&host).await.unwrap();
        assert_eq!(sdu.as_ref(), b"hello");

        let req = peer.signal().await;
        assert_eq!(req.code, code::DISCONNECTION_REQ);
        assert_eq!(req.u16(0), PEER_CID);
        assert_eq!(req.u16(2), y_cid);
        assert_eq!(y.state(), ChannelState::DisconnectRequested);
        assert_eq!(z.state(), ChannelState::Connected);
        drop(sdu);

        let mut buf = [0; 100];
        assert!(y.receive(&host, &mut buf).await.is_err());
    })
    .await;
}

#[tokio::test]
async fn partial_sdu_released_on_disconnect() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 1, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());
    let config = L2capChannelConfig {
        mtu: Some(100),
        mps: Some(64),
        ..Default::default()
    };

    run_single(&host, async {
        let conn = host.accept().await;
        peer.send_signal(code::LE_CONN_REQ, 1, &le16(&[PSM, PEER_CID, 100, 64, 10]));
        let mut ch = L2capChannel::accept(&host, &conn, &[PSM], &config).await.unwrap();
        let res = peer.signal().await;
        assert_eq!(res.code, code::LE_CONN_RES);
        assert_eq!(res.u16(8), 0);
        let dcid = res.u16(0);
        assert_eq!(dcid, ch.local_cid());
        // One packet backs one credit.
        assert_eq!(res.u16(6), 1);

        let (received, ()) = tokio::join!(
            async {
                let mut buf = [0; 100];
                ch.receive(&host, &mut buf).await
            },
            async {
                let mut pdu = le16(&[100]);
                pdu.extend_from_slice(&[0xAA; 58]);
                peer.send_pdu(dcid, &pdu);
                // The rest of the SDU goes to the packet already held.
                let ind = peer.signal().await;
                assert_eq!(ind.code, code::FLOW_IND);
                assert_eq!(ind.u16(0), dcid);
                assert_eq!(ind.u16(2), 1);
                peer.send_signal(code::DISCONNECTION_REQ, 2, &le16(&[dcid, PEER_CID]));
                let res = peer.signal().await;
                assert_eq!(res.code, code::DISCONNECTION_RES);
                assert_eq!(res.ident, 2);
            }
        );
        assert!(is_host_error(&received, Error::Disconnected));
        assert_eq!(ch.state(), ChannelState::Disconnected);
        drop(ch);

        // The only packet of the pool must be free again for a new SDU.
        peer.send_signal(code::LE_CONN_REQ, 3, &le16(&[PSM, PEER_CID + 1, 100, 64, 10]));
        let mut ch = L2capChannel::accept(&host, &conn, &[PSM], &config).await.unwrap();
        let res = peer.signal().await;
        assert_eq!(res.u16(6), 1);
        let dcid = res.u16(0);
        let sdu: Vec<u8> = (0..100).collect();
        let mut first = le16(&[100]);
        first.extend_from_slice(&sdu[..62]);
        peer.send_pdu(dcid, &first);
        assert_eq!(peer.signal().await.code, code::FLOW_IND);
        peer.send_pdu(dcid, &sdu[62..]);
        let mut buf = [0; 100];
        assert_eq!(ch.receive(&host, &mut buf).await.unwrap(), 100);
        assert_eq!(buf[..], sdu[..]);
    })
    .await;
}

#[tokio::test]
async fn pool_exhaustion_withholds_credits() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 1, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());
    let config = L2capChannelConfig {
        mtu: Some(100),
        mps: Some(100),
        ..Default::default()
    };

    run_single(&host, async {
        let conn = host.accept().await;
        peer.send_signal(code::LE_CONN_REQ, 1, &le16(&[PSM, PEER_CID, 100, 100, 10]));
        let mut ch = L2capChannel::accept(&host, &conn, &[PSM], &config).await.unwrap();
        let res = peer.signal().await;
        assert_eq!(res.u16(6), 1);
        let dcid = res.u16(0);

        peer.send_sdu(dcid, &[1; 50], 100);
        let first = ch.receive_sdu(&host).await.unwrap();
        assert_eq!(first.as_ref(), &[1; 50][..]);

        // The only packet is held by the application, so the peer gets no credit.
        settle().await;
        assert_eq!(peer.pending_frames(), 0);
        assert_eq!(ch.rx_credits(), 0);
        assert!(is_host_error(&ch.try_receive_sdu(&host), Error::Busy));

        drop(first);
        let ind = peer.signal().await;
        assert_eq!(ind.code, code::FLOW_IND);
        assert_eq!(ind.u16(0), dcid);
        assert_eq!(ind.u16(2), 1);

        peer.send_sdu(dcid, &[2; 50], 100);
        let second = ch.receive_sdu(&host).await.unwrap();
        assert_eq!(second.as_ref(), &[2; 50][..]);
        assert_eq!(ch.state(), ChannelState::Connected);
    })
    .await;
}

#[tokio::test]
async fn credits_bounded_by_receive_queue() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<1, 16, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let conn = host.accept().await;
        peer.send_signal(code::LE_CONN_REQ, 1, &le16(&[PSM, PEER_CID, 100, 23, 10]));
        let mut ch = L2capChannel::accept(&host, &conn, &[PSM], &le_config()).await.unwrap();
        let res = peer.signal().await;
        let dcid = res.u16(0);
        assert_eq!(res.u16(6) as usize, L2CAP_RX_QUEUE_SIZE);

        for i in 0..L2CAP_RX_QUEUE_SIZE as u8 {
            peer.send_sdu(dcid, &[i; 4], 23);
        }
        settle().await;
        ch.give_credits(&host, 10).unwrap();
        settle().await;
        assert_eq!(peer.pending_frames(), 0);
        assert_eq!(ch.rx_credits(), 0);

        // One SDU leaves the queue, so one more can be granted.
        let sdu = ch.receive_sdu(&host).await.unwrap();
        assert_eq!(sdu.as_ref(), &[0; 4][..]);
        drop(sdu);
        let ind = peer.signal().await;
        assert_eq!(ind.code, code::FLOW_IND);
        assert_eq!(ind.u16(2), 1);
        settle().await;
        assert_eq!(peer.pending_frames(), 0);
        assert_eq!(ch.rx_credits(), 1);
    })
    .await;
}

#[tokio::test]
async fn shared_sdu_outlives_channel() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 4, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let conn = host.accept().await;
        peer.send_signal(code::LE_CONN_REQ, 1, &le16(&[PSM, PEER_CID, 100, 100, 10]));
        let mut ch = L2capChannel::accept(&host, &conn, &[PSM], &L2capChannelConfig::default())
            .await
            .unwrap();
        let dcid = peer.signal().await.u16(0);
        peer.send_sdu(dcid, b"hello", 100);

        let shared = ch.receive_sdu(&host).await.unwrap().into_shared();
        let copy = shared.clone();
        drop(ch);
        let mut req = peer.signal().await;
        while req.code == code::FLOW_IND {
            req = peer.signal().await;
        }
        assert_eq!(req.code, code::DISCONNECTION_REQ);
        assert_eq!(shared.as_ref(), b"hello");
        assert_eq!(copy.as_ref(), b"hello");
    })
    .await;
}

#[tokio::test]
async fn enhanced_channels_round_trip() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 8), buffers(27, 8));
    let a = common::host::<4, 16, 128>(&wire, 0, Qos::None);
    let b = common::host::<4, 16, 128>(&wire, 1, Qos::None);
    wire.link_up(handle());

    run_pair(&a, &b, async {
        let (ca, cb) = tokio::join!(a.accept(), b.accept());
        let config = enhanced_config();
        let (tx, rx) = tokio::join!(
            L2capChannel::create_multi::<_, 3>(&a, &ca, PSM, &config),
            L2capChannel::accept_multi::<_, 3>(&b, &cb, &[PSM], &config)
        );
        let mut tx = tx.unwrap();
        let mut rx = rx.unwrap();
        for (t, r) in tx.iter().zip(rx.iter()) {
            assert_eq!(t.kind(), ChannelKind::Enhanced);
            assert_eq!(t.peer_cid(), r.local_cid());
            assert_eq!(t.peer_mtu(), 100);
        }

        let send = async {
            for (i, ch) in tx.iter_mut().enumerate() {
                ch.send(&a, &[i as u8; 100]).await.unwrap();
            }
        };
        let recv = async {
            for (i, ch) in rx.iter_mut().enumerate().rev() {
                let sdu = ch.receive_sdu(&b).await.unwrap();
                assert_eq!(sdu.as_ref(), &[i as u8; 100][..]);
            }
        };
        tokio::join!(send, recv);
    })
    .await;
}

#[tokio::test]
async fn enhanced_rejection_frees_all_channels() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let conn = host.accept().await;
        let config = enhanced_config();

        // A peer without enhanced support rejects the command.
        let (result, ()) = tokio::join!(L2capChannel::create_multi::<_, 2>(&host, &conn, PSM, &config), async {
            let req = peer.signal().await;
            assert_eq!(req.code, code::ECRED_CONN_REQ);
            assert_eq!(req.payload.len(), 12);
            peer.send_signal(code::COMMAND_REJECT, req.ident, &le16(&[0]));
        });
        assert!(is_host_error(&result, Error::CommandRejected(0)));

        let (result, ()) = tokio::join!(L2capChannel::create_multi::<_, 2>(&host, &conn, PSM, &config), async {
            let req = peer.signal().await;
            peer.send_signal(code::ECRED_CONN_RES, req.ident, &le16(&[100, 64, 4, 0x0004, 0, 0]));
        });
        assert!(is_host_error(
            &result,
            Error::ConnectionRejected(LeCreditConnResultCode::NoResources)
        ));

        // One channel was set up by the peer, it is torn down again.
        let (result, ()) = tokio::join!(L2capChannel::create_multi::<_, 2>(&host, &conn, PSM, &config), async {
            let req = peer.signal().await;
            let first = req.u16(8);
            peer.send_signal(code::ECRED_CONN_RES, req.ident, &le16(&[100, 64, 4, 0x0004, PEER_CID, 0]));
            let disc = peer.signal().await;
            assert_eq!(disc.code, code::DISCONNECTION_REQ);
            assert_eq!(disc.u16(0), PEER_CID);
            assert_eq!(disc.u16(2), first);
            peer.send_signal(code::DISCONNECTION_RES, disc.ident, &le16(&[PEER_CID, first]));
        });
        assert!(is_host_error(
            &result,
            Error::ConnectionRejected(LeCreditConnResultCode::NoResources)
        ));
        settle().await;

        // Both slots are free again.
        let (result, ()) = tokio::join!(L2capChannel::create_multi::<_, 2>(&host, &conn, PSM, &config), async {
            let req = peer.signal().await;
            peer.send_signal(
                code::ECRED_CONN_RES,
                req.ident,
                &le16(&[100, 64, 4, 0, PEER_CID, PEER_CID + 1]),
            );
        });
        let channels = result.unwrap();
        assert_eq!(channels[0].peer_cid(), PEER_CID);
        assert_eq!(channels[1].peer_cid(), PEER_CID + 1);
        assert_eq!(channels[1].tx_credits(), 4);
    })
    .await;
}

#[tokio::test]
async fn le_connection_refused() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<1, 8, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let conn = host.accept().await;
        for _ in 0..2 {
            let le_cfg = le_config();
            let (result, ()) = tokio::join!(L2capChannel::create(&host, &conn, PSM, &le_cfg), async {
                let req = peer.signal().await;
                peer.send_signal(code::LE_CONN_RES, req.ident, &le16(&[0, 0, 0, 0, 0x0002]));
            });
            assert!(is_host_error(
                &result,
                Error::ConnectionRejected(LeCreditConnResultCode::SpsmNotSupported)
            ));
        }
    })
    .await;
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let a = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let b = common::host::<2, 8, 128>(&wire, 1, Qos::None);
    wire.link_up(handle());

    run_pair(&a, &b, async {
        let (ca, cb) = tokio::join!(a.accept(), b.accept());
        let config = le_config();
        let (tx, rx) = tokio::join!(
            L2capChannel::create(&a, &ca, PSM, &config),
            L2capChannel::accept(&b, &cb, &[PSM], &config)
        );
        let mut tx = tx.unwrap();
        let mut rx = rx.unwrap();

        let (received, ()) = tokio::join!(
            async {
                let mut buf = [0; 100];
                rx.receive(&b, &mut buf).await
            },
            async {
                tx.disconnect(&a).await;
                tx.disconnect(&a).await;
            }
        );
        assert!(is_host_error(&received, Error::Disconnected));
        assert_eq!(tx.state(), ChannelState::Disconnected);
        assert_eq!(rx.state(), ChannelState::Disconnected);
        assert!(is_host_error(&tx.send(&a, b"late").await, Error::Disconnected));
        rx.disconnect(&b).await;
    })
    .await;
}

#[tokio::test]
async fn try_send_reports_busy() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let conn = host.accept().await;
        let le_cfg = le_config();
        let (ch, ()) = tokio::join!(L2capChannel::create(&host, &conn, PSM, &le_cfg), async {
            let req = peer.signal().await;
            peer.send_signal(code::LE_CONN_RES, req.ident, &le16(&[PEER_CID, 100, 23, 1, 0]));
        });
        let mut ch = ch.unwrap();
        settle().await;
        let before = wire.written(0).len();

        // Three PDUs with a single credit.
        assert!(is_host_error(&ch.try_send(&host, &[0; 60]), Error::Busy));
        assert_eq!(wire.written(0).len(), before);
        assert_eq!(ch.tx_credits(), 1);

        ch.try_send(&host, &[5; 20]).unwrap();
        let (_, pdu) = peer.pdu().await;
        assert_eq!(pdu[..2], [20, 0]);
        assert_eq!(pdu[2..], [5; 20]);
        assert!(is_host_error(&ch.try_send(&host, &[6; 1]), Error::Busy));

        // A controller that refuses writes.
        peer.send_signal(code::FLOW_IND, 2, &le16(&[PEER_CID, 1]));
        settle().await;
        wire.set_busy(0, true);
        let before = wire.written(0).len();
        assert!(is_host_error(&ch.try_send(&host, &[7; 10]), Error::Busy));
        assert_eq!(wire.written(0).len(), before);
        assert_eq!(ch.state(), ChannelState::Connected);
        assert_eq!(ch.tx_credits(), 1);

        wire.set_busy(0, false);
        ch.try_send(&host, &[7; 10]).unwrap();
        assert_eq!(peer.pdu().await.1[2..], [7; 10]);
    })
    .await;
}

#[tokio::test]
async fn dropped_send_disconnects_channel() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let conn = host.accept().await;
        let le_cfg = le_config();
        let (ch, ()) = tokio::join!(L2capChannel::create(&host, &conn, PSM, &le_cfg), async {
            let req = peer.signal().await;
            peer.send_signal(code::LE_CONN_RES, req.ident, &le16(&[PEER_CID, 100, 23, 1, 0]));
        });
        let mut ch = ch.unwrap();
        let local = ch.local_cid();

        tokio::select! {
            _ = ch.send(&host, &[9; 60]) => panic!("send finished without credits"),
            (cid, _) = peer.pdu() => assert_eq!(cid, PEER_CID),
        }

        let req = peer.signal().await;
        assert_eq!(req.code, code::DISCONNECTION_REQ);
        assert_eq!(req.u16(0), PEER_CID);
        assert_eq!(req.u16(2), local);
        peer.send_signal(code::DISCONNECTION_RES, req.ident, &le16(&[PEER_CID, local]));
        settle().await;
        assert_eq!(ch.state(), ChannelState::Disconnected);
    })
    .await;
}

#[tokio::test]
async fn reconfigure_enhanced_channel() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 8), buffers(27, 8));
    let a = common::host::<4, 8, 128>(&wire, 0, Qos::None);
    let b = common::host::<4, 8, 128>(&wire, 1, Qos::None);
    wire.link_up(handle());

    run_pair(&a, &b, async {
        let (ca, cb) = tokio::join!(a.accept(), b.accept());
        let config = enhanced_config();
        let (tx, rx) = tokio::join!(
            L2capChannel::create_multi::<_, 1>(&a, &ca, PSM, &config),
            L2capChannel::accept_multi::<_, 1>(&b, &cb, &[PSM], &config)
        );
        let [mut tx] = tx.unwrap();
        let [mut rx] = rx.unwrap();

        rx.reconfigure(&b, 120, 80).await.unwrap();
        assert_eq!(rx.mtu(), 120);
        assert_eq!(rx.mps(), 80);
        assert_eq!(tx.peer_mtu(), 120);
        assert_eq!(tx.peer_mps(), 80);
        tx.reconfigure(&a, 120, 80).await.unwrap();
        assert_eq!(rx.peer_mtu(), 120);

        // The MTU may only grow.
        assert!(is_host_error(&rx.reconfigure(&b, 100, 80).await, Error::InvalidValue));

        let sdu = [3; 120];
        let (sent, received) = tokio::join!(tx.send(&a, &sdu), rx.receive_sdu(&b));
        sent.unwrap();
        assert_eq!(received.unwrap().as_ref(), &sdu[..]);

        let le_cfg = le_config();
        let (le_a, le_b) = tokio::join!(
            L2capChannel::create(&a, &ca, PSM, &le_cfg),
            L2capChannel::accept(&b, &cb, &[PSM], &le_cfg)
        );
        let mut le_a = le_a.unwrap();
        let _le_b = le_b.unwrap();
        assert!(is_host_error(&le_a.reconfigure(&a, 120, 64).await, Error::NotSupported));
    })
    .await;
}

#[tokio::test]
async fn link_loss_fails_channels() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let a = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let b = common::host::<2, 8, 128>(&wire, 1, Qos::None);
    wire.link_up(handle());

    run_pair(&a, &b, async {
        let (ca, cb) = tokio::join!(a.accept(), b.accept());
        let config = le_config();
        let (tx, rx) = tokio::join!(
            L2capChannel::create(&a, &ca, PSM, &config),
            L2capChannel::accept(&b, &cb, &[PSM], &config)
        );
        let mut tx = tx.unwrap();
        let mut rx = rx.unwrap();

        let (received, ()) = tokio::join!(
            async {
                let mut buf = [0; 100];
                rx.receive(&b, &mut buf).await
            },
            async {
                settle().await;
                wire.link_down(handle());
            }
        );
        assert!(is_host_error(&received, Error::Disconnected));
        settle().await;
        assert!(!ca.is_connected());
        assert!(!cb.is_connected());
        assert_eq!(tx.state(), ChannelState::Disconnected);
        assert!(tx.send(&a, b"gone").await.is_err());

        let result = L2capChannel::create(&a, &ca, PSM, &config).await;
        assert!(is_host_error(&result, Error::NotConnected));
    })
    .await;
}

#[tokio::test]
async fn unknown_signal_is_rejected() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let host = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let peer = wire.peer(1);
    wire.link_up(handle());

    run_single(&host, async {
        let _conn = host.accept().await;
        peer.send_signal(code::ECHO_REQ, 9, &[1, 2, 3]);
        let rej = peer.signal().await;
        assert_eq!(rej.code, code::COMMAND_REJECT);
        assert_eq!(rej.ident, 9);
        assert_eq!(rej.u16(0), 0);

        // Credits for a channel that does not exist are ignored.
        peer.send_signal(code::FLOW_IND, 10, &le16(&[0x0070, 1]));
        settle().await;
        assert_eq!(peer.pending_frames(), 0);
    })
    .await;
}

#[tokio::test]
async fn segmented_receive() {
    let _ = env_logger::try_init();
    let wire = Wire::new(buffers(27, 4), buffers(27, 4));
    let a = common::host::<2, 8, 128>(&wire, 0, Qos::None);
    let b = common::host::<2, 8, 128>(&wire, 1, Qos::None);
    wire.link_up(handle());

    run_pair(&a, &b, async {
        let (ca, cb) = tokio::join!(a.accept(), b.accept());
        let segmented = L2capChannelConfig {
            mtu: Some(100),
            mps: Some(64),
            initial_credits: Some(4),
            mode: RxMode::Segmented,
            ..Default::default()
        };
        let enhanced_cfg = enhanced_config();
        let (tx, rx) = tokio::join!(
            L2capChannel::create(&a, &ca, PSM, &enhanced_cfg),
            L2capChannel::accept(&b, &cb, &[PSM], &segmented)
        );
        let mut tx = tx.unwrap();
        let mut rx = rx.unwrap();
        assert!(is_host_error(&rx.try_receive_sdu(&b), Error::InvalidState));

        let sdu: Vec<u8> = (0..100).collect();
        tx.send(&a, &sdu).await.unwrap();

        let first = rx.receive_segment(&b).await.unwrap();
        assert_eq!(first.sdu_len(), 100);
        assert_eq!(first.offset(), 0);
        assert!(!first.is_last());
        assert_eq!(first.data(), &sdu[..62]);
        let second = rx.receive_segment(&b).await.unwrap();
        assert_eq!(second.offset(), 62);
        assert!(second.is_last());
        assert_eq!(second.data(), &sdu[62..]);
        drop((first, second));

        settle().await;
        assert_eq!(rx.rx_credits(), 2);
        assert_eq!(tx.tx_credits(), 2);

        rx.give_credits(&b, 2).unwrap();
        settle().await;
        assert_eq!(rx.rx_credits(), 4);
        assert_eq!(tx.tx_credits(), 4);
    })
    .await;
}
