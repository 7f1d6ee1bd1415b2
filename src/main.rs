use hearth::{AppError, Config, Environ, ResponseBody, StartResponse};

fn hello(env: &mut Environ, start: &mut StartResponse) -> Result<ResponseBody, AppError> {
    start.start(
        "200 OK",
        vec![("Content-Type".to_string(), "text/plain".to_string())],
    )?;
    Ok(format!("Hello from hearth: {}\n", env.path).into())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cfg = Config::load()?;
    hearth::server::run(cfg, hello)
}
