// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Demo driver: two stacks joined by an in-memory link, serviced at a
//! millisecond cadence. Node A sends an acknowledged message to node B and
//! both sides report what they saw.

use anyhow::{Context, Result};
use lontalk_stack_rs::{
    app::{IndicationKind, MsgOutAddr},
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    models::addressing::ServiceType,
    node::address_book::TxParams,
    node::persist::MemoryNvm,
    stack::{NullLed, Stack},
    timer::SystemClock,
};
use tokio::time::{Duration, interval};
use tracing::info;

fn shuttle(frames_from: &mut Stack, to: &mut Stack) {
    while let Some(frame) = frames_from.link_out_pop() {
        to.link_in_push(frame);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logger("tests/config_logger.yaml")?;

    let cfg_a = resolve_config_path("tests/config_node_a.yaml")
        .and_then(Config::load_from_file)
        .context("failed to load node A config")?;
    let cfg_b = resolve_config_path("tests/config_node_b.yaml")
        .and_then(Config::load_from_file)
        .context("failed to load node B config")?;

    let mut a = Stack::new(
        &cfg_a,
        Box::new(SystemClock::new()),
        Box::new(MemoryNvm::default()),
        Box::new(NullLed),
    )?;
    let mut b = Stack::new(
        &cfg_b,
        Box::new(SystemClock::new()),
        Box::new(MemoryNvm::default()),
        Box::new(NullLed),
    )?;
    info!(?a, ?b, "stacks up");

    // Queue one acknowledged message A -> B once the reset quiet period is
    // over; then service both stacks until the completion arrives.
    let mut sent = false;
    let mut ticker = interval(Duration::from_millis(1));
    for _ in 0..8000u32 {
        ticker.tick().await;
        a.service();
        b.service();
        shuttle(&mut a, &mut b);
        shuttle(&mut b, &mut a);

        if !sent {
            if let Some(msg) = a.msg_alloc() {
                msg.tag = 1;
                msg.service = ServiceType::Ackd;
                msg.code = 0x40;
                msg.data = vec![0x11, 0x22];
                msg.addr = MsgOutAddr::SubnetNode {
                    domain_index: 0,
                    subnet: 1,
                    node: 3,
                    tx: TxParams { rpt_timer: 0, retry: 3, tx_timer: 3, long_timer: false },
                };
                a.msg_send();
                sent = true;
                info!("queued ACKD message to node B");
            }
        }

        if let Some(event) = b.receive() {
            if event.kind == IndicationKind::Message {
                info!(code = event.apdu.code, data = ?event.apdu.data, "node B received");
            }
        }
        if let Some(event) = a.receive() {
            if event.kind == IndicationKind::Completion {
                info!(success = event.success, "node A completion");
                break;
            }
        }
    }

    Ok(())
}
