// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the worker channel framing.

use neemata_protocol::{
    ExecuteInvoke, ExecuteResult, Frame, FrameError, MessageKind, WireError, WorkerMessage,
    read_frame, write_frame,
};
use uuid::Uuid;

#[tokio::test]
async fn sequential_frames_preserve_order() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let messages = vec![
        WorkerMessage::Ready,
        WorkerMessage::ExecuteInvoke(ExecuteInvoke {
            correlation_id: Uuid::new_v4(),
            task_name: "reports/build".to_string(),
            args: vec![serde_json::json!({"month": "05"})],
        }),
        WorkerMessage::Stop,
    ];

    for msg in &messages {
        write_frame(&mut client, &msg.to_frame().unwrap())
            .await
            .unwrap();
    }

    for expected in &messages {
        let frame = read_frame(&mut server).await.unwrap();
        let got = WorkerMessage::from_frame(&frame).unwrap();
        assert_eq!(got.kind(), expected.kind());
    }
}

#[tokio::test]
async fn execute_round_trip_over_channel() {
    let (mut api_side, mut task_side) = tokio::io::duplex(4096);
    let correlation_id = Uuid::new_v4();

    let invoke = WorkerMessage::ExecuteInvoke(ExecuteInvoke {
        correlation_id,
        task_name: "math/add".to_string(),
        args: vec![serde_json::json!(2), serde_json::json!(3)],
    });
    write_frame(&mut api_side, &invoke.to_frame().unwrap())
        .await
        .unwrap();

    // Task side decodes the request and answers on the same channel.
    let frame = read_frame(&mut task_side).await.unwrap();
    let request = match WorkerMessage::from_frame(&frame).unwrap() {
        WorkerMessage::ExecuteInvoke(req) => req,
        other => panic!("unexpected message: {:?}", other),
    };
    assert_eq!(request.task_name, "math/add");

    let result = WorkerMessage::ExecuteResult(ExecuteResult::ok(
        request.correlation_id,
        serde_json::json!(5),
    ));
    write_frame(&mut task_side, &result.to_frame().unwrap())
        .await
        .unwrap();

    let frame = read_frame(&mut api_side).await.unwrap();
    match WorkerMessage::from_frame(&frame).unwrap() {
        WorkerMessage::ExecuteResult(res) => {
            assert_eq!(res.correlation_id, correlation_id);
            assert_eq!(res.output, Some(serde_json::json!(5)));
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[tokio::test]
async fn error_results_carry_wire_errors() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    let id = Uuid::new_v4();

    let result = WorkerMessage::ExecuteResult(ExecuteResult::err(
        id,
        WireError::new("TASK_WORKER_LOST", "task worker crashed mid-call"),
    ));
    write_frame(&mut a, &result.to_frame().unwrap()).await.unwrap();

    let frame = read_frame(&mut b).await.unwrap();
    assert_eq!(frame.kind, MessageKind::ExecuteResult);
    let res: ExecuteResult = frame.decode().unwrap();
    assert_eq!(res.error.unwrap().code, "TASK_WORKER_LOST");
}

#[test]
fn oversized_frame_is_rejected() {
    // Encoded length field larger than the cap must fail before allocation.
    let mut buf = Vec::new();
    buf.extend_from_slice(&(u32::MAX).to_be_bytes());
    buf.extend_from_slice(&(MessageKind::Ready as u16).to_be_bytes());

    let err = Frame::decode_from_bytes(bytes::Bytes::from(buf)).unwrap_err();
    assert!(matches!(err, FrameError::FrameTooLarge(..)));
}
