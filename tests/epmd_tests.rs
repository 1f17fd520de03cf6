//! EPMD client against the in-process EPMD.
mod support;

use erl_node::epmd::EpmdClient;
use support::MiniEpmd;
use tokio::net::TcpStream;

async fn connect(epmd: &MiniEpmd) -> TcpStream {
    TcpStream::connect(("127.0.0.1", epmd.port()))
        .await
        .expect("EPMD connect failed")
}

#[tokio::test]
async fn register_and_lookup() {
    let epmd = MiniEpmd::start().await;

    let info = erl_node::epmd::NodeInfo::new("regtest", 12345);
    let (keepalive, creation) = EpmdClient::new(connect(&epmd).await)
        .register(info)
        .await
        .expect("register failed");
    assert!(creation.get() > 0);

    let found = EpmdClient::new(connect(&epmd).await)
        .get_node_info("regtest")
        .await
        .expect("lookup failed")
        .expect("node should be registered");
    assert_eq!(found.port, 12345);
    assert_eq!(found.name, "regtest");
    assert_eq!(found.highest_version, 5);

    // Dropping the registration socket unpublishes the node.
    drop(keepalive);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let gone = EpmdClient::new(connect(&epmd).await)
        .get_node_info("regtest")
        .await
        .expect("lookup failed");
    assert!(gone.is_none());
}

#[tokio::test]
async fn names_listing() {
    let epmd = MiniEpmd::start().await;

    let (_keepalive, _) = EpmdClient::new(connect(&epmd).await)
        .register(erl_node::epmd::NodeInfo::new("lister", 4444))
        .await
        .expect("register failed");

    let names = EpmdClient::new(connect(&epmd).await)
        .get_names()
        .await
        .expect("names failed");
    assert!(names
        .iter()
        .any(|entry| entry.name == "lister" && entry.port == 4444));
}

#[tokio::test]
async fn stop_request() {
    let epmd = MiniEpmd::start().await;

    let (_keepalive, _) = EpmdClient::new(connect(&epmd).await)
        .register(erl_node::epmd::NodeInfo::new("stopme", 5555))
        .await
        .expect("register failed");

    let status = EpmdClient::new(connect(&epmd).await)
        .stop("stopme")
        .await
        .expect("stop failed");
    assert_eq!(status, "STOPPED");

    let status = EpmdClient::new(connect(&epmd).await)
        .stop("missing")
        .await
        .expect("stop failed");
    assert_eq!(status, "NOEXIST");
}
