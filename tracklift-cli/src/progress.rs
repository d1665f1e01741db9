use std::sync::Arc;
use std::time::Duration;

use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracklift_engine::{DownloadState, TrackEvent, TrackProgress};

const BAR_TEMPLATE: &str =
    "{prefix:>14.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}";
const REFRESH_INTERVAL: Duration = Duration::from_millis(150);

/// One bar per track, refreshed from the pipelines' progress handles.
pub struct ProgressReporter {
    multi: MultiProgress,
    bars: Vec<(ProgressBar, Arc<TrackProgress>)>,
    style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new(hidden: bool) -> Self {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            multi,
            bars: Vec::new(),
            style,
        }
    }

    pub fn add(&mut self, track_id: &str, progress: Arc<TrackProgress>) {
        let bar = self.multi.add(ProgressBar::new(progress.total()));
        bar.set_style(self.style.clone());
        bar.set_prefix(track_id.to_string());
        bar.set_message(DownloadState::Pending.to_string());
        self.bars.push((bar, progress));
    }

    /// Handle for printing lines above the bars.
    pub fn printer(&self) -> LinePrinter {
        LinePrinter(self.multi.clone())
    }

    /// Starts the refresh loop; it ends when `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        let reporter = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => reporter.refresh(),
                }
            }
            reporter.finish();
        })
    }

    fn refresh(&self) {
        for (bar, progress) in &self.bars {
            let snapshot = progress.snapshot();
            bar.set_position(snapshot.decrypted);
            bar.set_message(format!(
                "{} {}",
                snapshot.state,
                HumanBytes(snapshot.bytes_written)
            ));
        }
    }

    fn finish(&self) {
        self.refresh();
        for (bar, progress) in &self.bars {
            if progress.state() == DownloadState::Completed {
                bar.finish();
            } else {
                bar.abandon();
            }
        }
    }
}

#[derive(Clone)]
pub struct LinePrinter(MultiProgress);

impl LinePrinter {
    /// Prints without tearing the bars; falls back to stdout when they are
    /// hidden.
    pub fn println(&self, line: impl AsRef<str>) {
        if self.0.is_hidden() {
            println!("{}", line.as_ref());
        } else {
            let _ = self.0.println(line);
        }
    }
}

/// Prints key resolution events until the job's event stream closes.
pub fn spawn_key_printer(
    mut events: broadcast::Receiver<TrackEvent>,
    printer: LinePrinter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TrackEvent::KeyResolved {
                    track_id,
                    kid,
                    source,
                }) => printer.println(format!("[{track_id}] key {kid} from {source}")),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
