// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end exchange over the anonymous transport: the agent serves the
//! fd-exchange socket, the target pushes its descriptor-only regions
//! through it, and the two sides talk over the resulting mappings.

#![cfg(unix)]

use mlos_core::context::{Context, ContextOptions, ContextTransport};
use mlos_core::dispatch::GlobalDispatchTable;
use mlos_core::messages::IntrinsicRegistry;
use mlos_ipc::exchange::SOCKET_FILE_NAME;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn anonymous_regions_bootstrap_over_the_socket() {
    let socket_dir = tempfile::tempdir().unwrap();
    let options = ContextOptions {
        product: format!("MlosTestAnon{}", std::process::id()),
        socket_dir: socket_dir.path().to_owned(),
        ..ContextOptions::default()
    };

    let agent_handle = {
        let options = options.clone();
        std::thread::spawn(move || Context::attach_agent_anonymous(&options).unwrap())
    };

    // The target blocks on the rendezvous event until the agent's socket is
    // listening, then pushes its regions through it.
    let target = Context::create_target_anonymous(&options).unwrap();
    assert_eq!(target.transport(), ContextTransport::AnonymousFds);
    assert!(socket_dir.path().join(SOCKET_FILE_NAME).exists());
    assert!(socket_dir.path().join("mlos.sock.opened").exists());

    let agent = Arc::new(agent_handle.join().unwrap());
    assert_eq!(agent.transport(), ContextTransport::AnonymousFds);
    assert_eq!(target.attached_processes(), 2);

    // The mappings are the same memory: an in-band announcement crosses.
    let announced: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut agent_table = GlobalDispatchTable::new();
    {
        let announced = announced.clone();
        agent_table
            .add_registry(&IntrinsicRegistry::new().on_register_assembly(move |request| {
                announced.lock().unwrap().push(request.registry_name);
            }))
            .unwrap();
    }

    std::thread::scope(|scope| {
        let reader = {
            let agent = agent.clone();
            let table = &agent_table;
            scope.spawn(move || agent.run_control_reader(table))
        };

        target.register_settings_assembly("AnonSmartCache").unwrap();
        wait_until(Duration::from_secs(10), || {
            announced.lock().unwrap().len() == 1
        });
        assert_eq!(
            *announced.lock().unwrap(),
            vec!["AnonSmartCache".to_owned()]
        );

        let sync = target.control_channel().sync();
        assert_eq!(
            sync.read_position.load(Ordering::Acquire),
            sync.write_position.load(Ordering::Acquire)
        );

        target.terminate_control_channel();
        reader.join().unwrap().unwrap();
    });

    drop(target);
    drop(agent);
    // The regions were descriptor-only; nothing to unlink, and the socket
    // files disappear with the server.
    assert!(!socket_dir.path().join(SOCKET_FILE_NAME).exists());
}
