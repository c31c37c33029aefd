use std::net::TcpListener as StdListener;
use std::sync::mpsc;

use axum::Router;

/// Serve `router` on an ephemeral loopback port from a background thread.
pub fn serve(router: Router) -> u16 {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build runtime");
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind mock server");
            let port = listener.local_addr().expect("local addr").port();
            tx.send(port).expect("report port");
            axum::serve(listener, router).await.expect("serve");
        });
    });
    rx.recv().expect("mock server port")
}

/// A loopback port nothing is listening on (at the time of the call).
pub fn free_port() -> u16 {
    let listener = StdListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}
