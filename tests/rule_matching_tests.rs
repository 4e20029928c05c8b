use mockproxy::prelude::*;

mod common;

#[tokio::test]
async fn higher_priority_rules_win_regardless_of_insertion_order() {
    let proxy = common::start_proxy().await;
    proxy.add_rules(vec![
        RuleBuilder::get("/race")
            .then_reply(200, "first")
            .build()
            .unwrap(),
        RuleBuilder::get("/race")
            .priority(10)
            .then_reply(200, "preferred")
            .build()
            .unwrap(),
    ]);

    let response = reqwest::get(format!("{}/race", proxy.url().unwrap()))
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "preferred");
    proxy.stop().await;
}

#[tokio::test]
async fn exhausted_once_rules_fall_through_to_later_rules() {
    let proxy = common::start_proxy().await;
    proxy.add_rules(vec![
        RuleBuilder::get("/seq")
            .once()
            .then_reply(200, "first hit")
            .build()
            .unwrap(),
        RuleBuilder::get("/seq")
            .then_reply(200, "later hits")
            .build()
            .unwrap(),
    ]);
    let url = proxy.url().unwrap();

    let first = reqwest::get(format!("{}/seq", url)).await.unwrap();
    let second = reqwest::get(format!("{}/seq", url)).await.unwrap();
    let third = reqwest::get(format!("{}/seq", url)).await.unwrap();

    assert_eq!(first.text().await.unwrap(), "first hit");
    assert_eq!(second.text().await.unwrap(), "later hits");
    // The last checkerless rule repeats forever.
    assert_eq!(third.text().await.unwrap(), "later hits");
    proxy.stop().await;
}

#[tokio::test]
async fn query_parameters_match_as_a_subset() {
    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::get("/translate")
            .match_query_param("word", "hello")
            .then_reply(200, "ohi")
            .build()
            .unwrap(),
    );
    let url = proxy.url().unwrap();

    let matching = reqwest::get(format!("{}/translate?word=hello&extra=1", url))
        .await
        .unwrap();
    assert_eq!(matching.status(), 200);
    assert_eq!(matching.text().await.unwrap(), "ohi");

    let wrong_value = reqwest::get(format!("{}/translate?word=bye", url))
        .await
        .unwrap();
    assert_eq!(wrong_value.status(), 503);

    proxy.stop().await;
}

#[tokio::test]
async fn header_and_body_matchers_compose() {
    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::post("/submit")
            .match_header("content-type", "application/json")
            .match_json_body_including(serde_json::json!({"kind": "test"}))
            .then_reply(201, "accepted")
            .build()
            .unwrap(),
    );
    let url = proxy.url().unwrap();
    let client = common::http_client();

    let matching = client
        .post(format!("{}/submit", url))
        .header("content-type", "application/json")
        .body(r#"{"kind":"test","extra":[1,2,3]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(matching.status(), 201);

    let wrong_body = client
        .post(format!("{}/submit", url))
        .header("content-type", "application/json")
        .body(r#"{"kind":"other"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_body.status(), 503);

    proxy.stop().await;
}

#[tokio::test]
async fn set_rules_replaces_the_previous_list_atomically() {
    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::get("/old")
            .then_reply(200, "old")
            .build()
            .unwrap(),
    );

    proxy.set_rules(vec![RuleBuilder::get("/new")
        .then_reply(200, "new")
        .build()
        .unwrap()]);
    let url = proxy.url().unwrap();

    let old = reqwest::get(format!("{}/old", url)).await.unwrap();
    assert_eq!(old.status(), 503);

    let new = reqwest::get(format!("{}/new", url)).await.unwrap();
    assert_eq!(new.text().await.unwrap(), "new");

    proxy.stop().await;
}

#[tokio::test]
async fn pending_endpoints_reports_unused_rules() {
    let proxy = common::start_proxy().await;
    proxy.add_rules(vec![
        RuleBuilder::get("/used")
            .once()
            .then_reply(200, "ok")
            .build()
            .unwrap(),
        RuleBuilder::get("/unused")
            .once()
            .then_reply(200, "ok")
            .build()
            .unwrap(),
    ]);

    reqwest::get(format!("{}/used", proxy.url().unwrap()))
        .await
        .unwrap();

    let pending = proxy.pending_endpoints();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].explain().contains("/unused"));

    proxy.stop().await;
}

#[tokio::test]
async fn custom_matcher_callbacks_run_per_request() {
    use mockproxy::server::intake::OngoingRequest;
    use std::sync::Arc;

    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::anything()
            .matching(
                "with an even content length",
                Arc::new(|req: &OngoingRequest| {
                    Box::pin(async move {
                        let body = req.decoded_body().await.map_err(|e| e.to_string())?;
                        Ok(body.len() % 2 == 0)
                    })
                }),
            )
            .then_reply(200, "even")
            .build()
            .unwrap(),
    );
    let url = proxy.url().unwrap();
    let client = common::http_client();

    let even = client
        .post(format!("{}/x", url))
        .body("ab")
        .send()
        .await
        .unwrap();
    assert_eq!(even.status(), 200);

    let odd = client
        .post(format!("{}/x", url))
        .body("abc")
        .send()
        .await
        .unwrap();
    assert_eq!(odd.status(), 503);

    proxy.stop().await;
}
