//! Host manager, one server and one gate wired together over loopback TCP.

use mesh_core::property::{FieldKind, PropertyDecl, PropertySetting, PropertyTree, TypeRegistry};
use mesh_core::protocol::InstanceRole;
use mesh_core::rpc::RpcAuthority;
use mesh_core::sync::SubscriberKind;
use mesh_core::RpcError;
use mesh_server::cluster::BootstrapState;
use mesh_server::{ClientPush, EntityKind, HostManager, Instance, MeshClient, MeshConfig, Node, RpcMethodTable};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(10);

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn loopback_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.host_manager.port = free_port();
    config.host_manager.heartbeat_interval_ms = 200;
    config.host_manager.expect_service_manager = false;
    config.service_manager = None;
    config.gates[0].port = free_port();
    config.gates[0].client_port = free_port();
    config.servers[0].port = free_port();
    config.validate().unwrap();
    config
}

struct Cluster {
    config: Arc<MeshConfig>,
    shutdown: CancellationToken,
    server: Arc<Node>,
    gate: Arc<Node>,
    tasks: Vec<JoinHandle<Result<(), mesh_server::ServerError>>>,
}

impl Cluster {
    async fn start() -> Self {
        let config = Arc::new(loopback_config());
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(HostManager::new(config.clone(), shutdown.clone()).start()));

        let server = Instance::bind(config.clone(), InstanceRole::Server, "server_0", shutdown.clone())
            .await
            .unwrap();
        let gate = Instance::bind(config.clone(), InstanceRole::Gate, "gate_0", shutdown.clone())
            .await
            .unwrap();
        let (server_node, gate_node) = (server.node(), gate.node());
        tasks.push(tokio::spawn(server.run()));
        tasks.push(tokio::spawn(gate.run()));

        for node in [&server_node, &gate_node] {
            let mut state = node.state();
            timeout(STEP, state.wait_for(|s| *s == BootstrapState::Running))
                .await
                .expect("instance never reached Running")
                .unwrap();
        }

        Self {
            config,
            shutdown,
            server: server_node,
            gate: gate_node,
            tasks,
        }
    }

    /// Connects a client once the gate's client port is open.
    async fn client(&self, id: &str) -> (MeshClient, tokio::sync::mpsc::UnboundedReceiver<ClientPush>) {
        let address = self.config.gates[0].client_address();
        for _ in 0..100 {
            if let Ok(attached) = MeshClient::connect(&address, id, self.shutdown.child_token()).await {
                return attached;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("gate never accepted client '{id}'");
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let result = timeout(STEP, task).await.expect("task did not stop").unwrap();
            assert!(result.is_ok());
        }
    }
}

#[tokio::test]
async fn test_client_call_reaches_server_root() {
    let cluster = Cluster::start().await;
    assert_eq!(cluster.gate.peer_count(), 1);

    let (client, _pushes) = cluster.client("player_1").await;
    assert_eq!(client.mailbox().id, "player_1");
    assert!(client.mailbox().compare_only_address(cluster.gate.mailbox()));

    let pending = client
        .call(cluster.server.mailbox().clone(), "describe", Vec::new())
        .unwrap();
    let description = timeout(STEP, pending.wait()).await.unwrap().unwrap();
    assert_eq!(description["role"], json!("server"));
    assert_eq!(description["mailbox"]["id"], json!("server_0"));

    // Request and reply both crossed the gate.
    assert!(cluster.gate.router_stats().forwarded >= 2);
    assert_eq!(cluster.gate.client_count(), 1);

    client.close();
    cluster.stop().await;
}

#[tokio::test]
async fn test_client_owned_property_is_pushed_to_client() {
    let cluster = Cluster::start().await;

    let mut tree = PropertyTree::new(Arc::new(TypeRegistry::new()));
    tree.declare_property(
        PropertyDecl::new("gold", FieldKind::Leaf(0i64.into()))
            .setting(PropertySetting::CLIENT_OWN)
            .policy(cluster.server.sync_policy(true)),
    )
    .unwrap();

    let server = Arc::downgrade(&cluster.server);
    let methods = RpcMethodTable::new().with("login", RpcAuthority::CLIENT_STUB, move |entity, rpc| {
        let server = server.upgrade();
        async move {
            let server = server.ok_or_else(|| RpcError::InvocationFailed("server gone".to_string()))?;
            let bonus: i64 = rpc.arg(0)?;
            server.subscribe(entity.id(), rpc.sender.clone(), SubscriberKind::Client);
            entity
                .with_tree(|tree| {
                    let gold = tree.root_of("gold")?;
                    tree.set_value(gold, bonus)
                })
                .transpose()
                .map_err(|e| RpcError::InvocationFailed(e.to_string()))?;
            Ok::<_, RpcError>(json!(true))
        }
    });
    let avatar = cluster
        .server
        .create_entity("avatar_1", EntityKind::Entity, methods, Some(tree))
        .unwrap();

    let (client, mut pushes) = cluster.client("player_1").await;
    let pending = client
        .call(avatar.mailbox.clone(), "login", vec![json!(250)])
        .unwrap();
    assert_eq!(timeout(STEP, pending.wait()).await.unwrap().unwrap(), json!(true));

    let sync = timeout(STEP, async {
        loop {
            match pushes.recv().await {
                Some(ClientPush::PropertySync(sync)) => return sync,
                Some(ClientPush::Rpc(_)) => continue,
                None => panic!("gate closed the client connection"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(sync.target.id, "player_1");
    assert_eq!(sync.commands.entity_id, "player_1");
    assert_eq!(sync.commands.commands[0].path, vec!["gold".to_string()]);

    client.close();
    cluster.stop().await;
}

#[tokio::test]
async fn test_server_only_method_is_refused_to_clients() {
    let cluster = Cluster::start().await;
    cluster
        .server
        .create_entity(
            "vault",
            EntityKind::Entity,
            RpcMethodTable::new().with("drain", RpcAuthority::SERVER_ONLY, |_, _| async {
                Ok::<_, RpcError>(json!("drained"))
            }),
            None,
        )
        .unwrap();

    let (client, _pushes) = cluster.client("player_2").await;
    let target = cluster.server.mailbox().with_id("vault");
    let pending = client.call(target, "drain", Vec::new()).unwrap();

    // Refused calls are logged on the server and never answered.
    assert!(timeout(Duration::from_millis(500), pending.wait()).await.is_err());

    client.close();
    cluster.stop().await;
}
