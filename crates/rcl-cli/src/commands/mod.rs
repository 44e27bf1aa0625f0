pub mod completions;
pub mod gc;
pub mod images;
pub mod import;
pub mod recover;
pub mod rm;
pub mod rmi;
pub mod snapshots;
pub mod status;
pub mod unpack;
pub mod verify_store;

use indicatif::{ProgressBar, ProgressStyle};
use rcl_core::{shutdown_requested, LayerApplier, Unpacker};
use rcl_schema::Platform;
use rcl_store::{
    ContentSource, ContentStore, ImageStore, LocalSnapshotter, SnapshotKind, SnapshotterMode,
    StoreConfig, StoreError, StoreLayout,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// Global flags that select and configure the store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub root: PathBuf,
    pub snapshotter: Option<String>,
    pub platform: Option<String>,
}

/// Every store component opened against one root.
pub struct Store {
    pub layout: StoreLayout,
    pub content: Arc<ContentStore>,
    pub images: ImageStore,
    pub snapshotter: LocalSnapshotter,
    pub applier: LayerApplier,
    pub platform: Platform,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Initialize the layout if needed and load its config. Flags override
    /// the config file.
    pub fn open(opts: &StoreOptions) -> Result<Self, String> {
        let layout = StoreLayout::new(&opts.root);
        layout.initialize().map_err(store_err)?;
        let config = StoreConfig::load_or_default(&layout).map_err(store_err)?;

        let mode = match &opts.snapshotter {
            Some(s) => s.parse::<SnapshotterMode>()?,
            None => config.snapshotter,
        };
        let platform = match &opts.platform {
            Some(p) => p.parse::<Platform>()?.normalize(),
            None => config.target_platform(),
        };

        let content = Arc::new(ContentStore::new(layout.clone()));
        let source: Arc<dyn ContentSource> = content.clone();
        Ok(Self {
            images: ImageStore::new(layout.clone()),
            snapshotter: LocalSnapshotter::new(layout.clone(), mode),
            applier: LayerApplier::new(source, layout.tmp_dir()),
            content,
            layout,
            platform,
        })
    }

    pub fn unpacker(&self) -> Unpacker<'_> {
        Unpacker::new(&self.content, &self.images, &self.snapshotter, &self.applier)
            .with_platform(self.platform.clone())
            .with_cancel(shutdown_requested)
    }
}

pub fn store_err(e: StoreError) -> String {
    format!("store error: {e}")
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_kind(kind: SnapshotKind) -> String {
    use console::Style;
    let text = kind.to_string();
    match kind {
        SnapshotKind::Committed => Style::new().green().apply_to(text).to_string(),
        SnapshotKind::Active => Style::new().yellow().apply_to(text).to_string(),
        SnapshotKind::View => Style::new().cyan().apply_to(text).to_string(),
    }
}

/// Shorten a digest or chain ID to `alg:` plus twelve hex characters.
pub fn short_digest(s: &str) -> &str {
    match s.find(':') {
        Some(i) => &s[..(i + 13).min(s.len())],
        None => s,
    }
}
