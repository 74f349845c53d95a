//! Commands that talk to a running `loom serve`.

use loom_config::LoomConfig;
use loom_core::LoomError;

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .tcp_keepalive(None)
        .build()
        .unwrap_or_default()
}

fn authorized(config: &LoomConfig, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match config.server.api_key {
        Some(ref key) => req.header("Authorization", format!("Bearer {key}")),
        None => req,
    }
}

async fn read_json(
    listen: &str,
    sent: Result<reqwest::Response, reqwest::Error>,
) -> loom_core::Result<serde_json::Value> {
    let resp = sent.map_err(|e| {
        LoomError::Execution(format!("Cannot reach Loom at {listen}, is it running? ({e})"))
    })?;
    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| LoomError::Execution(e.to_string()))?;
    if !status.is_success() {
        let code = body["code"].as_str().unwrap_or("HTTP_ERROR");
        let message = body["message"].as_str().unwrap_or_default();
        return Err(LoomError::Execution(format!("{status} {code}: {message}")));
    }
    Ok(body)
}

pub(super) async fn cmd_submit(
    config: &LoomConfig,
    instruction: String,
    owner: String,
    key: Option<String>,
) -> loom_core::Result<()> {
    let listen = &config.server.listen;
    let body = serde_json::json!({
        "instruction": instruction,
        "ownerId": owner,
        "idempotencyKey": key,
    });
    let req = authorized(
        config,
        client()
            .post(format!("http://{listen}/api/v1/tasks/queue"))
            .json(&body),
    );
    let receipt = read_json(listen, req.send().await).await?;

    let task_id = receipt["taskId"].as_str().unwrap_or_default();
    if receipt["duplicate"].as_bool().unwrap_or(false) {
        println!("{task_id} already submitted ({})", receipt["status"].as_str().unwrap_or("?"));
    } else {
        println!("{task_id} accepted");
    }
    Ok(())
}

pub(super) async fn cmd_status(
    config: &LoomConfig,
    task_id: &str,
    owner: Option<&str>,
) -> loom_core::Result<()> {
    let listen = &config.server.listen;
    let mut req = client().get(format!("http://{listen}/api/v1/tasks/{task_id}"));
    if let Some(owner) = owner {
        req = req.header(loom_server::OWNER_HEADER, owner);
    }
    let task = read_json(listen, authorized(config, req).send().await).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}
