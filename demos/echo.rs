use serde_json::json;
use trellis_web::{Error, Handler, Mask, Method, Request, Response, Server, StatusCode};
use tracing_subscriber::EnvFilter;

struct Echo;

impl Handler for Echo {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
        let body = req.json().await?;

        resp.status(StatusCode::Ok).json(&json!({
            "path": req.uri(),
            "body": body,
        }))
    }
}

struct EchoError;

impl Handler for EchoError {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
        let message = req.error().map(|err| err.to_string()).unwrap_or_default();
        resp.json(&json!({ "error": message }))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // {"message": "...", "tags": ["..."]}, tags optional
    let message = Mask::object([
        ("message", Mask::string()),
        ("tags", Mask::array(Mask::string())),
    ])
    .optional("tags");

    Server::builder()
        .listen("127.0.0.1:8080".parse().unwrap())
        .route_masked(Method::Post, "/echo", Echo, Some(message), None)
        .error(Method::Post, "/", EchoError)
        .build()
        .unwrap()
        .launch()
        .await
        .unwrap();
}
