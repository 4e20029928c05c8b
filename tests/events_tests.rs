use mockproxy::prelude::*;
use std::time::Duration;

mod common;

async fn next_event(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn lifecycle_events_arrive_in_order_per_request() {
    let proxy = common::start_proxy().await;
    let endpoint = proxy.add_rule(
        RuleBuilder::get("/traced")
            .then_reply(200, "ok")
            .build()
            .unwrap(),
    );
    let mut events = proxy.subscribe();

    let response = reqwest::get(format!("{}/traced", proxy.url().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let initiated = match next_event(&mut events).await {
        Event::RequestInitiated(snapshot) => snapshot,
        other => panic!("expected request-initiated, got {:?}", other.kind()),
    };
    // The rule is not chosen yet at initiation time.
    assert_eq!(initiated.matched_rule_id, None);
    assert_eq!(initiated.path, "/traced");

    let request = match next_event(&mut events).await {
        Event::Request(snapshot) => snapshot,
        other => panic!("expected request, got {:?}", other.kind()),
    };
    assert_eq!(request.id, initiated.id);
    assert_eq!(request.matched_rule_id, Some(endpoint.id()));

    let response_event = match next_event(&mut events).await {
        Event::Response(snapshot) => snapshot,
        other => panic!("expected response, got {:?}", other.kind()),
    };
    assert_eq!(response_event.id, initiated.id);
    assert_eq!(response_event.status, 200);
    assert_eq!(response_event.body_size, Some(2));
    assert!(response_event.timing.headers_sent.is_some());

    proxy.stop().await;
}

#[tokio::test]
async fn closed_connections_emit_exactly_one_abort() {
    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::get("/gone")
            .then_close()
            .build()
            .unwrap(),
    );
    let mut events = proxy.subscribe();

    let result = reqwest::get(format!("{}/gone", proxy.url().unwrap())).await;
    assert!(result.is_err(), "the connection should die without a response");

    let mut aborts = 0;
    let mut responses = 0;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        match event {
            Event::Abort(snapshot) => {
                aborts += 1;
                assert_eq!(snapshot.error_code.as_deref(), Some("rule-close"));
            }
            Event::Response(_) => responses += 1,
            _ => {}
        }
    }
    assert_eq!(aborts, 1);
    assert_eq!(responses, 0);

    proxy.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn reset_rules_kill_the_socket_without_a_response() {
    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::get("/rst")
            .then_reset()
            .build()
            .unwrap(),
    );
    let mut events = proxy.subscribe();

    let result = reqwest::get(format!("{}/rst", proxy.url().unwrap())).await;
    assert!(result.is_err());

    let mut saw_abort = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        if let Event::Abort(snapshot) = event {
            assert_eq!(snapshot.error_code.as_deref(), Some("rule-reset"));
            saw_abort = true;
        }
    }
    assert!(saw_abort);

    proxy.stop().await;
}

#[tokio::test]
async fn callback_subscriptions_observe_matching_events() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::get("/counted")
            .then_reply(200, "ok")
            .build()
            .unwrap(),
    );

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_callback = seen.clone();
    proxy.on(EventKind::Response, move |_| {
        seen_in_callback.fetch_add(1, Ordering::SeqCst);
    });

    reqwest::get(format!("{}/counted", proxy.url().unwrap()))
        .await
        .unwrap();
    reqwest::get(format!("{}/counted", proxy.url().unwrap()))
        .await
        .unwrap();

    // Delivery is asynchronous, off the request path.
    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both response events should arrive");

    proxy.stop().await;
}

#[tokio::test]
async fn webhook_steps_notify_and_tolerate_failures() {
    // The webhook target is itself a mocked endpoint.
    let sink = common::start_proxy().await;
    let hook_endpoint = sink.add_rule(
        RuleBuilder::post("/hook")
            .then_reply(204, "")
            .build()
            .unwrap(),
    );
    let sink_port = sink.port().unwrap();

    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::get("/watched")
            .with_webhook(format!("http://127.0.0.1:{}/hook", sink_port), true)
            .then_reply(200, "done")
            .build()
            .unwrap(),
    );
    proxy.add_rule(
        RuleBuilder::get("/unreachable-hook")
            // Nothing listens on port 9; the step must tolerate it.
            .with_webhook("http://127.0.0.1:9/hook".to_string(), false)
            .then_reply(200, "still fine")
            .build()
            .unwrap(),
    );
    let url = proxy.url().unwrap();

    let watched = reqwest::get(format!("{}/watched", url)).await.unwrap();
    assert_eq!(watched.text().await.unwrap(), "done");
    assert_eq!(hook_endpoint.hits(), 1);
    let summary = hook_endpoint.seen_requests().pop().unwrap();
    assert_eq!(summary.method, "POST");

    let tolerant = reqwest::get(format!("{}/unreachable-hook", url))
        .await
        .unwrap();
    assert_eq!(tolerant.text().await.unwrap(), "still fine");

    proxy.stop().await;
    sink.stop().await;
}
