// The UPnP/DIAL HTTP surface: a device description, per-app status
// documents, and launch/stop endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::AppError;
use crate::server::{ServerState, CONFIG_ID, NAME, VERSION};

pub async fn serve(state: Arc<ServerState>, listener: TcpListener) -> Result<(), AppError> {
    let router = Router::new()
        .route("/", get(serve_home))
        .route("/upnp/description.xml", get(serve_description))
        .route("/apps/:name", get(serve_app_state).post(launch_app))
        .route("/apps/:name/run", delete(stop_app))
        .with_state(state);

    axum::serve(listener, router).await?;
    Ok(())
}

fn application_url(state: &ServerState) -> String {
    format!("http://{}:{}/apps/", state.local_ip, state.http_port)
}

async fn serve_description(State(state): State<Arc<ServerState>>) -> Response {
    info!("GET /upnp/description.xml");

    let body = format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0" configId="{config_id}">
	<specVersion>
		<major>1</major>
		<minor>0</minor>
	</specVersion>
	<device>
		<deviceType>urn:dial-multiscreen-org:device:dialreceiver:1</deviceType>
		<friendlyName>{friendly_name}</friendlyName>
		<manufacturer>-</manufacturer>
		<modelDescription>Play the audio of YouTube videos</modelDescription>
		<modelName>{model_name}</modelName>
		<modelNumber>{model_number}</modelNumber>
		<UDN>uuid:{uuid}</UDN>
		<serviceList>
			<service>
				<serviceType>urn:dial-multiscreen-org:service:dial:1</serviceType>
				<serviceId>urn:dial-multiscreen-org:serviceId:dial</serviceId>
				<SCPDURL>/upnp/notfound</SCPDURL>
				<controlURL>/upnp/notfound</controlURL>
				<eventSubURL></eventSubURL>
			</service>
		</serviceList>
	</device>
</root>
"#,
        config_id = CONFIG_ID,
        friendly_name = xml_escape(&state.friendly_name),
        model_name = NAME,
        model_number = VERSION,
        uuid = state.uuid,
    );

    (
        [("Application-URL", application_url(&state))],
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn serve_app_state(
    Path(name): Path<String>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    info!("GET /apps/{}", name);

    let app = match state.apps.get(name.as_str()) {
        Some(app) => app,
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    let running = app.running();
    let mut body = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<service xmlns="urn:dial-multiscreen-org:schemas:dial" dialVer="1.7">
<name>{}</name>
<options allowStop="false"/>
<state>{}</state>
"#,
        app.name(),
        if running { "running" } else { "stopped" },
    );
    if running {
        body.push_str(&format!(
            "<link rel=\"run\" href=\"run\"/>\n<additionalData>\n<screenId>{}</screenId>\n</additionalData>\n",
            app.data("screenId").unwrap_or_default(),
        ));
    }
    body.push_str("</service>\n");

    ([(header::CONTENT_TYPE, "text/xml; charset=utf-8")], body).into_response()
}

async fn launch_app(
    Path(name): Path<String>,
    State(state): State<Arc<ServerState>>,
    body: String,
) -> Response {
    info!("POST /apps/{}", name);

    let app = match state.apps.get(name.as_str()) {
        Some(app) => app,
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    app.start(&body).await;

    (
        StatusCode::CREATED,
        [(
            header::LOCATION,
            format!("{}{}/run", application_url(&state), name),
        )],
    )
        .into_response()
}

// Not advertized (allowStop=false), but still supported, to make it easy
// to re-enable the DELETE method.
async fn stop_app(Path(name): Path<String>, State(state): State<Arc<ServerState>>) -> Response {
    info!("DELETE /apps/{}/run", name);

    let app = match state.apps.get(name.as_str()) {
        Some(app) => app,
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    app.quit().await;
    StatusCode::OK.into_response()
}

async fn serve_home(State(state): State<Arc<ServerState>>) -> Response {
    let mut names: Vec<&&str> = state.apps.keys().collect();
    names.sort();

    let mut items = String::new();
    for name in names {
        let app = &state.apps[*name];
        items.push_str(&format!(
            "\t<li>{}{}</li>\n",
            app.name(),
            if app.running() { " (running)" } else { "" }
        ));
    }

    let body = format!(
        r#"<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
<title>{title}</title>
<meta name="viewport" content="width=device-width; initial-scale=1"/>
</head>
<body>
<h1>{title}</h1>
Apps:
<ul>
{items}</ul>
</body>
</html>
"#,
        title = xml_escape(&state.friendly_name),
        items = items,
    );

    (
        [(header::CONTENT_TYPE, "application/xhtml+xml; charset=utf-8")],
        body,
    )
        .into_response()
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
