//! TCP connect/accept scenarios driven through a single loop.

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;

use uvio::{Error, Loop, Tcp, TcpListener};

fn bound_listener(lp: &Loop) -> (TcpListener, SocketAddr) {
    let listener = TcpListener::new(lp);
    listener
        .bind("127.0.0.1:0".parse().unwrap())
        .expect("bind failed");
    let addr = listener.local_address().expect("local_address failed");
    assert_ne!(addr.port(), 0, "kernel should assign an ephemeral port");
    (listener, addr)
}

#[test]
fn successful_connect_delivers_callback_once() {
    let lp = Loop::new().expect("loop creation failed");

    // 1. Listener accepting in the same loop.
    let (listener, target) = bound_listener(&lp);
    let accepted = Rc::new(Cell::new(0u32));
    {
        let accepted = accepted.clone();
        let listener = listener.clone();
        listener
            .clone()
            .listen(16, move |conn| {
                accepted.set(accepted.get() + 1);
                conn.close();
                listener.close();
            })
            .expect("listen failed");
    }

    // 2. Connect and verify the remote address from inside the callback.
    let tcp = Tcp::new(&lp);
    let connected = Rc::new(Cell::new(0u32));
    {
        let connected = connected.clone();
        let tcp = tcp.clone();
        tcp.clone()
            .connect(target, move |result| {
                result.expect("connect failed");
                connected.set(connected.get() + 1);
                let remote = tcp.remote_address().expect("remote_address failed");
                assert_eq!(remote, target);
                tcp.close();
            })
            .expect("connect failed");
    }

    lp.run().expect("run failed");

    assert_eq!(connected.get(), 1, "connect callback must fire exactly once");
    assert_eq!(accepted.get(), 1, "accept callback must fire exactly once");
    assert_eq!(lp.handle_count(), 0);
}

#[test]
fn bind_conflict_reports_address_in_use() {
    let lp = Loop::new().expect("loop creation failed");

    let (first, addr) = bound_listener(&lp);
    first.listen(16, |_conn| {}).expect("listen failed");

    // Second bind of the same endpoint fails synchronously.
    let second = TcpListener::new(&lp);
    let err = second.bind(addr).expect_err("second bind should conflict");
    assert!(matches!(err, Error::Bind(_)));
    assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));

    first.close();
    second.close();
}

#[test]
fn local_address_during_connect_is_bound_not_garbage() {
    let lp = Loop::new().expect("loop creation failed");

    let (listener, target) = bound_listener(&lp);
    listener.listen(16, |_conn| {}).expect("listen failed");

    let tcp = Tcp::new(&lp);

    // Before any connect there is no socket yet: a well-defined error.
    assert!(matches!(tcp.local_address(), Err(Error::SocketQuery(_))));

    let done = Rc::new(Cell::new(false));
    {
        let done = done.clone();
        let tcp_cb = tcp.clone();
        let listener = listener.clone();
        tcp.connect(target, move |result| {
            result.expect("connect failed");
            done.set(true);
            tcp_cb.close();
            listener.close();
        })
        .expect("connect failed");
    }

    // Connect issued but not yet completed: the kernel has bound the
    // socket, so the query returns a real ephemeral address.
    let local = tcp.local_address().expect("local_address failed");
    assert_ne!(local.port(), 0);

    lp.run().expect("run failed");
    assert!(done.get());
}

#[test]
fn connect_is_rejected_outside_unbound_state() {
    let lp = Loop::new().expect("loop creation failed");

    let (listener, target) = bound_listener(&lp);
    listener.listen(16, |_conn| {}).expect("listen failed");

    let tcp = Tcp::new(&lp);
    {
        let tcp_cb = tcp.clone();
        let listener = listener.clone();
        tcp.connect(target, move |result| {
            result.expect("connect failed");
            tcp_cb.close();
            listener.close();
        })
        .expect("connect failed");
    }

    // A second connect while the first is in flight is a state error,
    // reported synchronously.
    let err = tcp
        .connect(target, |_| {})
        .expect_err("second connect should be rejected");
    assert!(matches!(err, Error::InvalidState(_)));

    lp.run().expect("run failed");
    assert_eq!(lp.handle_count(), 0);
}

#[test]
fn socket_options_toggle_on_connected_handle() {
    let lp = Loop::new().expect("loop creation failed");

    let (listener, target) = bound_listener(&lp);
    listener.listen(16, |_conn| {}).expect("listen failed");
    listener
        .set_simultaneous_accepts(false)
        .expect("set_simultaneous_accepts failed");

    let tcp = Tcp::new(&lp);
    {
        let tcp_cb = tcp.clone();
        let listener = listener.clone();
        tcp.connect(target, move |result| {
            result.expect("connect failed");
            tcp_cb.set_nodelay(true).expect("set_nodelay failed");
            tcp_cb
                .set_keepalive(true, 60)
                .expect("set_keepalive failed");
            tcp_cb.set_keepalive(false, 0).expect("set_keepalive failed");
            tcp_cb.close();
            listener.close();
        })
        .expect("connect failed");
    }

    lp.run().expect("run failed");
    assert_eq!(lp.handle_count(), 0);
}

#[test]
fn accepted_connection_addresses_line_up() {
    let lp = Loop::new().expect("loop creation failed");

    let (listener, target) = bound_listener(&lp);
    let server_saw = Rc::new(Cell::new(false));
    {
        let server_saw = server_saw.clone();
        let listener = listener.clone();
        listener
            .clone()
            .listen(16, move |conn| {
                // The accepted socket's local end is the listener's port.
                let local = conn.local_address().expect("local_address failed");
                assert_eq!(local.port(), target.port());
                conn.remote_address().expect("remote_address failed");
                server_saw.set(true);
                conn.close();
                listener.close();
            })
            .expect("listen failed");
    }

    let tcp = Tcp::new(&lp);
    {
        let tcp_cb = tcp.clone();
        tcp.connect(target, move |result| {
            result.expect("connect failed");
            tcp_cb.close();
        })
        .expect("connect failed");
    }

    lp.run().expect("run failed");
    assert!(server_saw.get());
}
