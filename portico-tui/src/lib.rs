//! Terminal dashboard for the tunnel client.
//!
//! [`model`] is the state machine, [`view`] the pure renderer, and [`run`]
//! the cooperative driver: one loop merging keyboard input, the 1 s tick,
//! and bus events, re-rendering from a fresh statistics snapshot.

pub mod model;
pub mod view;

pub use model::{Action, Model, Msg, Status};
pub use view::render;

use portico_common::Result;
use portico_core::events::EventBus;
use portico_core::stats::Stats;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Feed the first character of each stdin line into the message loop.
/// Line-buffered input keeps the terminal out of raw mode; interrupt
/// handling comes in through the cancellation token instead.
fn spawn_input_reader() -> mpsc::Receiver<char> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(ch) = line.chars().next() {
                if tx.send(ch).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

fn draw(frame: &str) {
    let mut stdout = std::io::stdout().lock();
    // Clear and repaint the whole frame
    let _ = write!(stdout, "\x1b[2J\x1b[H{frame}");
    let _ = stdout.flush();
}

/// Run the dashboard until `q` or cancellation. Quitting cancels the token
/// so the rest of the client tears down with it.
pub async fn run(
    bus: Arc<EventBus>,
    stats: Arc<Stats>,
    inspector_port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let mut subscriber = bus.subscribe();
    let mut bus_open = true;
    let mut input = spawn_input_reader();
    let mut input_open = true;
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    let mut model = Model::new(inspector_port);
    draw(&render(&model, &stats.snapshot()));

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => {
                debug!("dashboard cancelled");
                return Ok(());
            }
            _ = tick.tick() => Msg::Tick,
            event = subscriber.recv(), if bus_open => match event {
                Some(event) => Msg::Event(event),
                // Bus closed; the tick keeps stats live
                None => {
                    bus_open = false;
                    continue;
                }
            },
            key = input.recv(), if input_open => match key {
                Some(ch) => Msg::Key(ch),
                None => {
                    input_open = false;
                    continue;
                }
            },
        };

        match model.update(msg) {
            Action::Quit => {
                cancel.cancel();
                return Ok(());
            }
            Action::Continue => {}
        }

        draw(&render(&model, &stats.snapshot()));
    }
}
