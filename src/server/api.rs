//! REST API implementation using rouille.
//!
//! # Purpose
//!
//! Maps the HTTP surface onto the playback core: script installation goes to
//! the main loop through its [`LoopHandle`], reads go to the shared
//! [`ScriptRunner`], and process-level commands travel to the supervisor
//! over a channel.
//!
//! # Endpoints
//!
//! - `GET /screens` — connector scan with modes and `last_shown`
//! - `GET /media/<path>` — media probe; 404 when the file is absent
//! - `POST /play` — install a play script; 400 on parse/validation errors
//! - `POST /quit` — ask the supervisor to shut the server down
//!
//! All responses are JSON `{"req": <path>, "ok": bool, ...}`.
//!
//! # Thread safety
//!
//! The server thread never holds the loop mutex; `install_script` is a
//! pointer swap. Runner reads take the runner mutex briefly and may lag one
//! tick behind the players, which is within the control-plane contract.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::{error, info, warn};
use rouille::{router, Request, Response};
use serde_json::json;

use crate::mainloop::LoopHandle;
use crate::runner::ScriptRunner;
use crate::script::parse_script;

/// Commands the HTTP surface sends to the supervisor thread.
#[derive(Debug)]
pub enum ApiCommand {
    /// Orderly process shutdown.
    Quit,
}

/// REST API server.
pub struct ApiServer {
    runner: Arc<Mutex<ScriptRunner>>,
    loop_handle: LoopHandle,
    default_zero_time: f64,
    command_tx: Sender<ApiCommand>,
}

impl ApiServer {
    /// Start the API server in a background thread. Returns the command
    /// receiver for the supervisor. The thread runs until process exit.
    pub fn start(
        port: u16,
        trust_network: bool,
        default_zero_time: f64,
        runner: Arc<Mutex<ScriptRunner>>,
        loop_handle: LoopHandle,
    ) -> Receiver<ApiCommand> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let server = ApiServer { runner, loop_handle, default_zero_time, command_tx };
        let addr = if trust_network {
            info!("Listening to WHOLE NETWORK on port {}", port);
            format!("0.0.0.0:{}", port)
        } else {
            info!("Listening to localhost on port {}", port);
            format!("127.0.0.1:{}", port)
        };

        thread::spawn(move || server.run(&addr));
        command_rx
    }

    fn run(self, addr: &str) {
        match rouille::Server::new(addr, move |request| self.handle_request(request)) {
            Ok(server) => server.run(),
            Err(e) => {
                error!("Failed to start API server on {}: {}", addr, e);
                error!("Is another playout instance already running?");
            }
        }
    }

    fn handle_request(&self, request: &Request) -> Response {
        let response = self.route(request);
        info!("[{}] {} {}", response.status_code, request.method(), request.url());
        response
    }

    fn route(&self, request: &Request) -> Response {
        // Media paths contain slashes, which router! captures cannot span.
        let path = request.url();
        if request.method() == "GET" {
            if let Some(media_path) = path.strip_prefix("/media/") {
                return self.on_media(&path, media_path);
            }
        }

        router!(request,
            (GET) ["/screens"] => {
                self.on_screens()
            },
            (POST) ["/play"] => {
                self.on_play(request)
            },
            (POST) ["/quit"] => {
                self.on_quit()
            },
            _ => {
                Response::json(&json!({"req": path, "error": "Not found"}))
                    .with_status_code(404)
            }
        )
    }

    fn on_media(&self, req_path: &str, media_path: &str) -> Response {
        match self.runner.lock().unwrap().file_info(media_path) {
            Ok(info) => Response::json(&json!({
                "req": req_path,
                "ok": true,
                "media": info,
            })),
            Err(e) if e.is_not_found() => {
                Response::json(&json!({"req": req_path, "error": e.to_string()}))
                    .with_status_code(404)
            }
            Err(e) => Response::json(&json!({"req": req_path, "error": e.to_string()}))
                .with_status_code(500),
        }
    }

    fn on_screens(&self) -> Response {
        let runner = self.runner.lock().unwrap();
        let screens = match runner.screens() {
            Ok(screens) => screens,
            Err(e) => {
                return Response::json(&json!({"req": "/screens", "error": e.to_string()}))
                    .with_status_code(500);
            }
        };

        let mut screens_json = serde_json::Map::new();
        for screen in screens {
            let mut screen_json = serde_json::Map::new();
            screen_json.insert("detected".to_string(), json!(screen.detected));
            if let Some(mode) = screen.active_mode {
                screen_json.insert(
                    "active_mode".to_string(),
                    json!([mode.width, mode.height, mode.hz]),
                );
            }
            let mut modes: Vec<[u32; 3]> = screen
                .modes
                .iter()
                .map(|m| [m.width, m.height, m.hz])
                .collect();
            modes.sort_unstable();
            modes.dedup();
            screen_json.insert("modes".to_string(), json!(modes));
            if let Some(shown) = runner.last_shown(&screen.connector) {
                screen_json.insert("last_shown".to_string(), json!(shown.as_secs_f64()));
            }
            screens_json.insert(screen.connector, screen_json.into());
        }

        Response::json(&json!({"req": "/screens", "ok": true, "screens": screens_json}))
    }

    fn on_play(&self, request: &Request) -> Response {
        let mut body = String::new();
        match request.data() {
            Some(mut data) => {
                if let Err(e) = data.read_to_string(&mut body) {
                    return Response::json(&json!({"req": "/play", "error": e.to_string()}))
                        .with_status_code(400);
                }
            }
            None => {
                return Response::json(&json!({"req": "/play", "error": "Missing body"}))
                    .with_status_code(400);
            }
        }

        match parse_script(&body, self.default_zero_time) {
            Ok(script) => {
                self.loop_handle.install_script(Arc::new(script));
                Response::json(&json!({"req": "/play", "ok": true}))
            }
            Err(e) => {
                warn!("Rejected script: {}", e);
                Response::json(&json!({"req": "/play", "error": e.to_string()}))
                    .with_status_code(400)
            }
        }
    }

    fn on_quit(&self) -> Response {
        match self.command_tx.send(ApiCommand::Quit) {
            Ok(()) => Response::json(&json!({"req": "/quit", "ok": true})),
            Err(e) => Response::json(&json!({"req": "/quit", "error": e.to_string()}))
                .with_status_code(500),
        }
    }
}
