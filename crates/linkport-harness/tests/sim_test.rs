//! Deterministic network simulation of the echo protocol.

use std::{sync::Arc, time::Duration};

use linkport_harness::{LineClient, SimAcceptor, test_config};
use linkport_server::{LineEchoProtocol, Listener, Protocol};

#[test]
fn echo_over_simulated_network() {
    let mut sim = turmoil::Builder::new().simulation_duration(Duration::from_secs(30)).build();

    sim.host("server", || async {
        let acceptor = SimAcceptor::bind("0.0.0.0:8080").await?;
        let protocol: Arc<dyn Protocol> = Arc::new(LineEchoProtocol);
        let listener = Listener::builder(test_config(), protocol).build()?;
        listener.bind_with(Arc::new(acceptor))?;
        listener.start()?;
        std::future::pending::<()>().await;
        Ok(())
    });

    sim.client("client", async {
        let stream = turmoil::net::TcpStream::connect("server:8080").await?;
        let mut client = LineClient::new(stream);
        for word in ["alpha", "beta", "gamma"] {
            assert_eq!(client.request(word).await?.as_deref(), Some(word));
        }
        assert_eq!(client.request("quit").await?.as_deref(), Some("bye"));
        assert_eq!(client.read_line().await?, None);
        Ok(())
    });

    sim.run().unwrap();
}
