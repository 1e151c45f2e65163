use async_trait::async_trait;
use multiverse_core::broker::{BrokerConnection, EventBus};
use multiverse_core::listener::{ListenerHandle, ListenerStats};
use multiverse_core::{
    AgentIdentity, AgentListener, AgentRegistry, EchoHandler, FnHandler, ListenerRuntime,
    ListenerState, Message, MessageHandler, MessageKind, MessageRouter, MultiverseError, Reply,
    Result, SilentHandler, SubjectScheme,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

struct Fixture {
    bus: Arc<EventBus>,
    connection: Arc<BrokerConnection>,
    registry: Arc<AgentRegistry>,
    scheme: SubjectScheme,
    router: MessageRouter,
}

fn fixture(name: &str) -> Fixture {
    let bus = Arc::new(EventBus::new(name));
    let connection = Arc::new(BrokerConnection::in_memory(Arc::clone(&bus)));
    let registry = Arc::new(AgentRegistry::stock());
    let scheme = SubjectScheme::default();
    let router = MessageRouter::new(
        Arc::new(BrokerConnection::in_memory(Arc::clone(&bus))),
        Arc::clone(&registry),
        scheme.clone(),
    );
    Fixture {
        bus,
        connection,
        registry,
        scheme,
        router,
    }
}

async fn start(f: &Fixture, agent: &str, handler: Box<dyn MessageHandler>) -> ListenerHandle {
    AgentListener::new(&f.registry, agent, f.scheme.clone(), handler)
        .unwrap()
        .start(Arc::clone(&f.connection), Default::default())
        .await
        .unwrap()
}

async fn wait_for_stats(handle: &ListenerHandle, done: impl Fn(&ListenerStats) -> bool) -> ListenerStats {
    timeout(Duration::from_secs(2), async {
        loop {
            let stats = handle.stats();
            if done(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener did not reach expected stats")
}

#[tokio::test]
async fn messages_are_handled_in_publish_order() -> Result<()> {
    let f = fixture("listener-order");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = start(
        &f,
        "ray",
        Box::new(FnHandler::new(move |msg: &Message| {
            sink.lock().unwrap().push(msg.content().to_string());
            Ok(vec![])
        })),
    )
    .await;

    for i in 0..20 {
        f.router.send_dm("u1", "ray", &format!("m{i}")).await?;
    }
    wait_for_stats(&handle, |s| s.handled == 20).await;

    let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
    handle.shutdown().await
}

#[tokio::test]
async fn failing_message_does_not_stop_the_listener() -> Result<()> {
    let f = fixture("listener-failure");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = start(
        &f,
        "moss",
        Box::new(FnHandler::new(move |msg: &Message| {
            if msg.content() == "second" {
                return Err(MultiverseError::handler("moss", msg.id(), "cannot parse"));
            }
            sink.lock().unwrap().push(msg.content().to_string());
            Ok(vec![Reply::to_sender(msg, "ok")])
        })),
    )
    .await;

    for content in ["first", "second", "third"] {
        f.router.send_dm("u1", "moss", content).await?;
    }
    let stats = wait_for_stats(&handle, |s| s.handled + s.failed == 3).await;

    assert_eq!(stats.received, 3);
    assert_eq!(stats.handled, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(*seen.lock().unwrap(), vec!["first", "third"]);
    assert_eq!(handle.state(), ListenerState::Listening);
    handle.shutdown().await
}

struct PanicsOnce {
    panicked: bool,
}

#[async_trait]
impl MessageHandler for PanicsOnce {
    async fn handle(&mut self, message: &Message) -> Result<Vec<Reply>> {
        if !self.panicked {
            self.panicked = true;
            panic!("handler bug");
        }
        Ok(vec![Reply::to_sender(message, "recovered")])
    }
}

#[tokio::test]
async fn handler_panic_is_contained() -> Result<()> {
    let f = fixture("listener-panic");
    let handle = start(&f, "roy", Box::new(PanicsOnce { panicked: false })).await;

    f.router.send_dm("u1", "roy", "one").await?;
    f.router.send_dm("u1", "roy", "two").await?;
    let stats = wait_for_stats(&handle, |s| s.failed == 1 && s.published == 1).await;

    assert_eq!(stats.handled, 1);
    handle.shutdown().await
}

#[tokio::test]
async fn reply_goes_to_dm_stream_all_and_outbox() -> Result<()> {
    let f = fixture("listener-reply");
    let mut dm = f.connection.subscribe(&f.scheme.dm_stream("u1")?).await?;
    let mut outbox = f.connection.subscribe(&f.scheme.outbox("sylvia")?).await?;
    let handle = start(&f, "sylvia", Box::new(EchoHandler::new("sylvia"))).await;

    let inbound = f.router.send_dm("u1", "sylvia", "hello there").await?;

    let (_, reply) = timeout(Duration::from_secs(1), dm.next_message()).await.unwrap().unwrap();
    assert_eq!(reply.from_user(), "agent_sylvia");
    assert_eq!(reply.to_user(), "u1");
    assert_eq!(reply.kind(), MessageKind::Dm);
    assert_eq!(
        reply.content(),
        "Agent sylvia received your message: 'hello there...'"
    );
    assert_ne!(reply.id(), inbound.id());

    let (_, copy) = timeout(Duration::from_secs(1), outbox.next_message()).await.unwrap().unwrap();
    assert_eq!(copy, reply);

    // inbound: inbox + all, reply: dm + all + outbox
    wait_for_stats(&handle, |s| s.published == 1).await;
    assert_eq!(f.bus.total_published(), 5);
    handle.shutdown().await
}

#[tokio::test]
async fn reply_to_email_sender_reaches_their_dm_stream() -> Result<()> {
    let f = fixture("listener-email");
    let mut streams = f.connection.subscribe(&f.scheme.all_message_streams()).await?;
    let mut dm = f.connection.subscribe(&f.scheme.dm_stream("alice@example.com")?).await?;
    let handle = start(&f, "priya", Box::new(EchoHandler::new("priya"))).await;

    f.router.send_dm("alice@example.com", "priya", "hi").await?;

    let (subject, reply) = timeout(Duration::from_secs(1), dm.next_message()).await.unwrap().unwrap();
    assert_eq!(subject, "themultiverse.messages.dm.alice@example%2Ecom");
    assert_eq!(reply.to_user(), "alice@example.com");
    assert_eq!(reply.from_user(), "agent_priya");

    // all (inbound), then dm + all (reply)
    let mut seen = Vec::new();
    for _ in 0..3 {
        let (subject, _) = timeout(Duration::from_secs(1), streams.next_message()).await.unwrap().unwrap();
        seen.push(subject);
    }
    assert!(seen.contains(&"themultiverse.messages.dm.alice@example%2Ecom".to_string()));

    let stats = wait_for_stats(&handle, |s| s.published == 1).await;
    assert_eq!(stats.failed, 0);
    handle.shutdown().await
}

#[tokio::test]
async fn unaddressable_reply_publishes_nothing() -> Result<()> {
    let f = fixture("listener-unaddressable");
    let handle = start(
        &f,
        "roy",
        Box::new(FnHandler::new(|_: &Message| Ok(vec![Reply::new("", "into the void")]))),
    )
    .await;

    f.router.send_dm("u1", "roy", "reply to nobody").await?;
    let stats = wait_for_stats(&handle, |s| s.handled == 1).await;

    assert_eq!(stats.published, 0);
    // only the inbound inbox + mirror
    assert_eq!(f.bus.total_published(), 2);
    handle.shutdown().await
}

#[tokio::test]
async fn agent_reply_lands_in_other_agent_inbox() -> Result<()> {
    let f = fixture("listener-a2a");
    let roy = start(&f, "roy", Box::new(EchoHandler::new("roy"))).await;
    let sylvia = start(&f, "sylvia", Box::new(SilentHandler)).await;

    let sent = f.router.send_agent_to_agent("sylvia", "roy", "status?").await?;
    assert_eq!(sent.kind(), MessageKind::AgentToAgent);

    wait_for_stats(&sylvia, |s| s.handled == 1).await;
    wait_for_stats(&roy, |s| s.published == 1).await;

    roy.shutdown().await?;
    sylvia.shutdown().await
}

#[tokio::test]
async fn cancelled_listener_drains_and_stops_receiving() -> Result<()> {
    let f = fixture("listener-drain");
    let mut handle = start(&f, "tessa", Box::new(SilentHandler)).await;
    assert_eq!(handle.state(), ListenerState::Listening);

    f.router.send_dm("u1", "tessa", "before").await?;
    wait_for_stats(&handle, |s| s.handled == 1).await;

    handle.cancel();
    assert_eq!(handle.wait_for(ListenerState::Closed).await, ListenerState::Closed);
    assert_eq!(f.bus.subscription_count(), 0);

    f.router.send_dm("u1", "tessa", "after").await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.stats().received, 1);
    handle.shutdown().await
}

struct Lifecycle {
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageHandler for Lifecycle {
    async fn on_start(&mut self, agent: &AgentIdentity) -> Result<()> {
        self.events.lock().unwrap().push(format!("start:{}", agent.key));
        Ok(())
    }

    async fn handle(&mut self, message: &Message) -> Result<Vec<Reply>> {
        self.events.lock().unwrap().push(format!("handle:{}", message.content()));
        Ok(vec![])
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.events.lock().unwrap().push("shutdown".into());
        Ok(())
    }
}

#[tokio::test]
async fn lifecycle_hooks_run_around_handling() -> Result<()> {
    let f = fixture("listener-hooks");
    let events = Arc::new(Mutex::new(Vec::new()));
    let handle = start(
        &f,
        "planner",
        Box::new(Lifecycle {
            events: Arc::clone(&events),
        }),
    )
    .await;

    f.router.send_dm("u1", "planner", "plan it").await?;
    wait_for_stats(&handle, |s| s.handled == 1).await;
    handle.shutdown().await?;

    assert_eq!(
        *events.lock().unwrap(),
        vec!["start:planner", "handle:plan it", "shutdown"]
    );
    Ok(())
}

struct PanicsOnShutdown;

#[async_trait]
impl MessageHandler for PanicsOnShutdown {
    async fn handle(&mut self, _message: &Message) -> Result<Vec<Reply>> {
        Ok(vec![])
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        panic!("cleanup bug");
    }
}

#[tokio::test]
async fn shutdown_survives_a_crashed_listener_task() -> Result<()> {
    let f = fixture("listener-crash");
    let handle = start(&f, "ray", Box::new(PanicsOnShutdown)).await;
    f.router.send_dm("u1", "ray", "last words").await?;
    wait_for_stats(&handle, |s| s.handled == 1).await;

    // The task dies in on_shutdown; draining still completes
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn dedicated_connection_is_closed_with_the_listener() -> Result<()> {
    let registry = AgentRegistry::stock();
    let config = multiverse_core::BrokerConfig {
        url: "memory://listener-dedicated".into(),
        ..Default::default()
    };
    let bus = EventBus::named("listener-dedicated");

    let handle = AgentListener::new(&registry, "historian", SubjectScheme::default(), Box::new(SilentHandler))?
        .connect_and_start(&config, Default::default())
        .await?;
    assert_eq!(bus.subscription_count(), 1);

    handle.shutdown().await?;
    assert_eq!(bus.subscription_count(), 0);
    Ok(())
}

#[tokio::test]
async fn runtime_starts_one_listener_per_agent() -> Result<()> {
    let f = fixture("listener-runtime");
    let runtime = ListenerRuntime::new(
        Arc::clone(&f.connection),
        Arc::clone(&f.registry),
        f.scheme.clone(),
    );

    let started = runtime
        .spawn_all(|agent| Box::new(EchoHandler::new(agent.key.clone())))
        .await?;
    assert_eq!(started, 10);
    assert_eq!(runtime.running().len(), 10);
    assert_eq!(runtime.state("cynthia"), Some(ListenerState::Listening));

    assert!(matches!(
        runtime.spawn_agent("cynthia", Box::new(SilentHandler)).await,
        Err(MultiverseError::Config(_))
    ));

    f.router.broadcast("orchestrator@example.com", "standup").await?;
    timeout(Duration::from_secs(2), async {
        while runtime.stats().values().map(|s| s.handled).sum::<u64>() < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("broadcast not handled by every agent");

    runtime.stop_agent("ray").await?;
    assert_eq!(runtime.running().len(), 9);
    assert!(runtime.state("ray").is_none());

    runtime.shutdown().await?;
    assert!(runtime.running().is_empty());
    assert_eq!(f.bus.subscription_count(), 0);
    Ok(())
}
