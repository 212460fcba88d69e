use async_trait::async_trait;
use futures::future::join_all;
use shardmesh::protocol::{
    ClusterRequest, ClusterResponse, ConnectToSlavesRequest, ConnectToSlavesResponse,
    HandshakeSide, Hello, Ping, PingResponse, RejectRequests,
};
use shardmesh::{
    ClusterError, ClusterHandler, Connection, ConnectionOptions, NodeRole, Result, ShardMask,
    SlaveInfo,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::duplex;
use tokio::time::sleep;

/// Answers each CONNECT_TO_SLAVES with the first target's id, holding
/// earlier requests longer so responses come back in reverse order.
struct SlowEcho;

#[async_trait]
impl ClusterHandler for SlowEcho {
    async fn on_request(&self, _conn: &Connection, request: ClusterRequest) -> Result<ClusterResponse> {
        match request {
            ClusterRequest::Ping(_) => Ok(ClusterResponse::Ping(PingResponse {
                id: "S0".to_string(),
                shard_masks: vec![ShardMask::new(1)?],
            })),
            ClusterRequest::ConnectToSlaves(ConnectToSlavesRequest { targets }) => {
                let first = targets.first().map(|t| t.id.clone()).unwrap_or_default();
                let rank: u64 = first.trim_start_matches('T').parse().unwrap_or(0);
                sleep(Duration::from_millis(20 * (5 - rank))).await;
                Ok(ClusterResponse::ConnectToSlaves(ConnectToSlavesResponse {
                    results: vec![first],
                }))
            }
        }
    }
}

fn target(id: &str) -> SlaveInfo {
    SlaveInfo::new(id, "127.0.0.1:1".parse().unwrap(), vec![ShardMask::new(1).unwrap()])
}

fn pair(timeout: Option<Duration>) -> (Connection, Connection) {
    let (a, b) = duplex(64 * 1024);
    let master = Connection::spawn(
        a,
        HandshakeSide::Initiator,
        Hello::new(NodeRole::Master, "master"),
        Arc::new(RejectRequests),
        ConnectionOptions::new("to-slave").request_timeout(timeout),
    );
    let slave = Connection::spawn(
        b,
        HandshakeSide::Acceptor,
        Hello::new(NodeRole::Slave, "S0"),
        Arc::new(SlowEcho),
        ConnectionOptions::new("to-master"),
    );
    (master, slave)
}

#[tokio::test]
async fn test_reversed_responses_reach_their_callers() {
    let (master, _slave) = pair(None);
    master.await_active().await.unwrap();

    let ids: Vec<String> = (0..5).map(|i| format!("T{}", i)).collect();
    let calls = ids.iter().map(|id| {
        master.send_request(ClusterRequest::ConnectToSlaves(ConnectToSlavesRequest {
            targets: vec![target(id)],
        }))
    });
    let responses = join_all(calls).await;

    for (id, response) in ids.iter().zip(responses) {
        let response = response.unwrap().into_connect_to_slaves().unwrap();
        assert_eq!(response.results, vec![id.clone()]);
    }
}

#[tokio::test]
async fn test_mixed_request_kinds_interleave() {
    let (master, _slave) = pair(None);
    master.await_active().await.unwrap();

    let slow = master.send_request(ClusterRequest::ConnectToSlaves(ConnectToSlavesRequest {
        targets: vec![target("T0")],
    }));
    let fast = master.send_request(ClusterRequest::Ping(Ping::default()));
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(fast.unwrap().into_ping().unwrap().id, "S0");
    assert_eq!(
        slow.unwrap().into_connect_to_slaves().unwrap().results,
        vec!["T0".to_string()]
    );
}

#[tokio::test]
async fn test_timed_out_request_does_not_poison_connection() {
    let (master, _slave) = pair(Some(Duration::from_millis(30)));
    master.await_active().await.unwrap();

    let err = master
        .send_request(ClusterRequest::ConnectToSlaves(ConnectToSlavesRequest {
            targets: vec![target("T0")],
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Timeout(_)));

    // the late response for the abandoned id arrives meanwhile
    sleep(Duration::from_millis(150)).await;
    assert!(master.is_active());
    let ping = master
        .send_request(ClusterRequest::Ping(Ping::default()))
        .await
        .unwrap()
        .into_ping()
        .unwrap();
    assert_eq!(ping.id, "S0");
}

#[tokio::test]
async fn test_close_fails_every_pending_request() {
    let (master, slave) = pair(None);
    master.await_active().await.unwrap();

    let calls = (0..3).map(|i| {
        master.send_request(ClusterRequest::ConnectToSlaves(ConnectToSlavesRequest {
            targets: vec![target(&format!("T{}", i))],
        }))
    });
    let closer = async {
        sleep(Duration::from_millis(10)).await;
        slave.close("slave going away");
    };
    let (responses, _) = tokio::join!(join_all(calls), closer);

    for response in responses {
        assert!(matches!(response, Err(ClusterError::ConnectionClosed(_))));
    }
    master.closed().await;
    assert!(!master.is_active());
    assert!(master.send_request(ClusterRequest::Ping(Ping::default())).await.is_err());
}
