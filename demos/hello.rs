use trellis_web::{Error, Handler, Request, Response, Server, StatusCode};
use tracing_subscriber::EnvFilter;

struct Hello;

impl Handler for Hello {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
        let name = req.param("name")?.to_string();

        resp.status(StatusCode::Ok)
            .text(&format!("Hello, {name}! ({:?})", req.version()))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    Server::builder()
        .listen("127.0.0.1:8080".parse().unwrap())
        .get("/hello/[name]", Hello)
        .build()
        .unwrap()
        .launch()
        .await
        .unwrap();
}
