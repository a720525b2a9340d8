//! REST API exercised over real HTTP.

#![allow(clippy::panic, clippy::indexing_slicing)]

mod common;

use std::net::SocketAddr;

use reqwest::header::{
    ACCEPT, CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use serde_json::{Value, json};

use common::{API_KEY, pool, pool_id, serve};

fn encode(value: &str) -> String {
    value.replace(':', "%3A").replace('/', "%2F")
}

async fn reserve(client: &reqwest::Client, addr: SocketAddr, pool: &str, amount: u64) -> Value {
    let Ok(resp) = client
        .post(format!("http://{addr}/pools/{pool}/new-references?amount={amount}"))
        .header("X-Api-Key", API_KEY)
        .send()
        .await
    else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 200);
    let Ok(body) = resp.json::<Value>().await else {
        panic!("json body expected");
    };
    body
}

fn first_reference(body: &Value) -> (String, u64) {
    let reference = &body["references"][0];
    let (Some(uri), Some(index)) = (reference["uri"].as_str(), reference["index"].as_u64()) else {
        panic!("reference expected in {body}");
    };
    (uri.to_string(), index)
}

#[tokio::test]
async fn health_reports_configured_pools() {
    let (addr, _, _) = serve(vec![pool("a", 64, 1, |_| {}), pool("b", 64, 1, |_| {})]).await;
    let Ok(resp) = reqwest::get(format!("http://{addr}/health")).await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 200);
    let Ok(body) = resp.json::<Value>().await else {
        panic!("json body expected");
    };
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["pools"], 2);
}

#[tokio::test]
async fn new_references_checks_pool_key_and_amount() {
    let (addr, _, _) = serve(vec![pool("mdl", 64, 1, |_| {})]).await;
    let client = reqwest::Client::new();
    let url = |path: &str| format!("http://{addr}{path}");

    let cases = [
        ("/pools/mdl/new-references", None, 403),
        ("/pools/mdl/new-references", Some("wrong"), 403),
        ("/pools/unknown/new-references", Some(API_KEY), 400),
        ("/pools/Not%20Valid/new-references", Some(API_KEY), 400),
        ("/pools/mdl/new-references?amount=0", Some(API_KEY), 400),
        ("/pools/mdl/new-references?amount=abc", Some(API_KEY), 400),
    ];
    for (path, key, expected) in cases {
        let mut request = client.post(url(path));
        if let Some(key) = key {
            request = request.header("X-Api-Key", key);
        }
        let Ok(resp) = request.send().await else {
            panic!("request should complete");
        };
        assert_eq!(resp.status().as_u16(), expected, "{path} with {key:?}");
    }

    let Ok(resp) = client
        .post(url("/pools/mdl/new-references?count=3"))
        .header("X-Api-Key", API_KEY)
        .send()
        .await
    else {
        panic!("request should complete");
    };
    let Ok(body) = resp.json::<Value>().await else {
        panic!("json body expected");
    };
    assert_eq!(body["references"].as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn idempotency_key_replays_the_first_reservation() {
    let (addr, _, _) = serve(vec![pool("mdl", 64, 1, |_| {})]).await;
    let client = reqwest::Client::new();
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let Ok(resp) = client
            .post(format!("http://{addr}/pools/mdl/new-references?amount=2"))
            .header("X-Api-Key", API_KEY)
            .header("Idempotency-Key", "order-42")
            .send()
            .await
        else {
            panic!("request should complete");
        };
        let Ok(body) = resp.json::<Value>().await else {
            panic!("json body expected");
        };
        bodies.push(body);
    }
    assert_eq!(bodies.first(), bodies.last());
}

#[tokio::test]
async fn list_token_supports_conditional_requests() {
    let (addr, _, _) = serve(vec![pool("mdl", 64, 1, |_| {})]).await;
    let client = reqwest::Client::new();
    let (uri, _) = first_reference(&reserve(&client, addr, "mdl", 1).await);

    let Ok(resp) = client.get(&uri).send().await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("application/statuslist+jwt")
    );
    assert_eq!(
        resp.headers().get(CACHE_CONTROL).and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );
    let Some(etag) = resp
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        panic!("etag header expected");
    };
    let Ok(token) = resp.text().await else {
        panic!("token body expected");
    };
    assert_eq!(token.split('.').count(), 3);

    let Ok(resp) = client.get(&uri).header(IF_NONE_MATCH, &etag).send().await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 304);

    for path in [format!("/{}", uuid::Uuid::new_v4()), "/not-a-list".to_string()] {
        let Ok(resp) = client.get(format!("http://{addr}{path}")).send().await else {
            panic!("request should complete");
        };
        assert_eq!(resp.status().as_u16(), 404, "{path}");
    }
}

#[tokio::test]
async fn list_token_honours_accept_and_if_modified_since() {
    let (addr, _, _) = serve(vec![pool("mdl", 64, 1, |_| {})]).await;
    let client = reqwest::Client::new();
    let (uri, _) = first_reference(&reserve(&client, addr, "mdl", 1).await);

    for (accept, expected) in [
        ("application/statuslist+jwt", 200),
        ("application/*", 200),
        ("text/plain, */*;q=0.1", 200),
        ("application/json", 415),
        ("application/statuslist+jwt;q=0", 415),
    ] {
        let Ok(resp) = client.get(&uri).header(ACCEPT, accept).send().await else {
            panic!("request should complete");
        };
        assert_eq!(resp.status().as_u16(), expected, "{accept}");
    }

    let Ok(resp) = client.get(&uri).send().await else {
        panic!("request should complete");
    };
    let Some(last_modified) = resp
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        panic!("last-modified header expected");
    };

    let Ok(resp) = client
        .get(&uri)
        .header(IF_MODIFIED_SINCE, &last_modified)
        .send()
        .await
    else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 304);

    let Ok(resp) = client
        .get(&uri)
        .header(IF_MODIFIED_SINCE, "Mon, 01 Jan 2001 00:00:00 GMT")
        .send()
        .await
    else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 200);

    // A non-matching ETag wins over a fresh date.
    let Ok(resp) = client
        .get(&uri)
        .header(IF_NONE_MATCH, "\"stale\"")
        .header(IF_MODIFIED_SINCE, &last_modified)
        .send()
        .await
    else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn status_update_is_replay_checked_and_published() {
    let (addr, service, _) = serve(vec![pool("mdl", 64, 2, |_| {})]).await;
    let client = reqwest::Client::new();
    let (uri, index) = first_reference(&reserve(&client, addr, "mdl", 1).await);
    let update = |key: Option<&str>, request_id: &str, body: Value| {
        let mut request = client
            .post(format!("http://{addr}/api/update-status"))
            .header("X-Request-Id", request_id)
            .json(&body);
        if let Some(key) = key {
            request = request.header("X-Api-Key", key);
        }
        request.send()
    };
    let body = json!({ "uri": uri, "index": index, "value": 2 });

    let Ok(resp) = update(None, "r0", body.clone()).await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 403);
    let Ok(resp) = update(Some(API_KEY), "r1", body.clone()).await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 204);
    let Ok(resp) = update(Some(API_KEY), "r1", body).await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 409);

    let out_of_range = json!({ "uri": uri, "index": index, "value": 4 });
    let Ok(resp) = update(Some(API_KEY), "r2", out_of_range).await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 400);

    let Ok(entry) = service.registry().get(&pool_id("mdl")).await else {
        panic!("pool registered");
    };
    let Ok(written) = entry.writer.run_once().await else {
        panic!("writer cycle should succeed");
    };
    assert_eq!(written, 1);

    let Ok(resp) = client
        .get(format!(
            "http://{addr}/api/status?uri={}&index={index}",
            encode(&uri)
        ))
        .send()
        .await
    else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 200);
    let Ok(status) = resp.json::<Value>().await else {
        panic!("json body expected");
    };
    assert_eq!(status["value"], 2);
}

#[tokio::test]
async fn free_reference_rejects_unknown_references() {
    let (addr, _, _) = serve(vec![pool("mdl", 64, 1, |_| {})]).await;
    let client = reqwest::Client::new();
    let (uri, index) = first_reference(&reserve(&client, addr, "mdl", 1).await);
    let free = |body: Value| {
        client
            .post(format!("http://{addr}/api/free-reference"))
            .header("X-Api-Key", API_KEY)
            .json(&body)
            .send()
    };

    let Ok(resp) = free(json!({ "uri": uri, "index": index })).await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 204);

    let unknown = format!("http://{addr}/{}", uuid::Uuid::new_v4());
    let Ok(resp) = free(json!({ "uri": unknown, "index": 0 })).await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn aggregation_lists_every_pool_sharing_the_id() {
    let (addr, _, _) = serve(vec![
        pool("a", 64, 1, |p| {
            p.prefetch.capacity = 8;
            p.aggregation_id = Some("shared".to_string());
        }),
        pool("b", 64, 1, |p| {
            p.prefetch.capacity = 8;
            p.aggregation_id = Some("shared".to_string());
        }),
    ])
    .await;
    let client = reqwest::Client::new();
    let (uri_a, _) = first_reference(&reserve(&client, addr, "a", 1).await);
    let (uri_b, _) = first_reference(&reserve(&client, addr, "b", 1).await);

    let Ok(resp) = client
        .get(format!("http://{addr}/aggregation/shared"))
        .send()
        .await
    else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 200);
    let Ok(body) = resp.json::<Value>().await else {
        panic!("json body expected");
    };
    let Some(lists) = body["status_lists"].as_array() else {
        panic!("status_lists expected in {body}");
    };
    assert!(lists.iter().any(|v| v == uri_a.as_str()));
    assert!(lists.iter().any(|v| v == uri_b.as_str()));

    let Ok(resp) = client
        .get(format!("http://{addr}/aggregation/unknown"))
        .send()
        .await
    else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn pool_endpoints_report_shape_and_state() {
    let (addr, _, _) = serve(vec![pool("mdl", 64, 1, |_| {})]).await;
    let client = reqwest::Client::new();

    let Ok(resp) = client.get(format!("http://{addr}/api/pools")).send().await else {
        panic!("request should complete");
    };
    let Ok(pools) = resp.json::<Value>().await else {
        panic!("json body expected");
    };
    assert_eq!(pools[0]["pool_id"], "mdl");
    assert_eq!(pools[0]["size"], 64);

    let state_url = format!("http://{addr}/api/pools/mdl/state");
    let Ok(resp) = client.get(&state_url).send().await else {
        panic!("request should complete");
    };
    let Ok(state) = resp.json::<Value>().await else {
        panic!("json body expected");
    };
    assert_eq!(state["state"], "needs_list");

    let _ = reserve(&client, addr, "mdl", 1).await;
    let Ok(resp) = client.get(&state_url).send().await else {
        panic!("request should complete");
    };
    let Ok(state) = resp.json::<Value>().await else {
        panic!("json body expected");
    };
    assert_eq!(state["state"], "active");

    let Ok(resp) = client
        .get(format!("http://{addr}/api/pools/missing/state"))
        .send()
        .await
    else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let (addr, _, _) = serve(vec![pool("mdl", 64, 1, |_| {})]).await;
    let Ok(resp) = reqwest::get(format!("http://{addr}/api-docs/openapi.json")).await else {
        panic!("request should complete");
    };
    assert_eq!(resp.status().as_u16(), 200);
    let Ok(doc) = resp.json::<Value>().await else {
        panic!("json body expected");
    };
    assert!(doc["paths"]["/pools/{pool_id}/new-references"].is_object());
}
