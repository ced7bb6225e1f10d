#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use memory_squeezer::config::{Logging, SqueezerConfig, Theme, ThemeName, MIB};

#[test]
fn missing_file_writes_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    let cfg = SqueezerConfig::load_or_create(&path).expect("load");
    assert!(path.exists());
    assert_eq!(cfg, SqueezerConfig::default());
}

#[test]
fn defaults_round_trip_to_same_effective_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");

    let created = SqueezerConfig::load_or_create(&path).expect("create");
    let reloaded = SqueezerConfig::load(&path).expect("reload");
    assert_eq!(created, reloaded);

    let explicit = dir.path().join("explicit.toml");
    std::fs::write(
        &explicit,
        r#"
[Settings]
BlockSize = 10
ShowProgress = true
AllocationsPerSecond = 500
ReservePercent = 2.0
MemoryLimit = 256
VirtualMemoryLimit = 1024
SqueezeVirtualMemory = false
UseMultiprocessing = false
WorkerProcesses = 4

[Window]
Width = 600
Height = 500

[Theme]
Theme = "Light"
ProgressBarColor = "0,128,255"

[Logging]
LogFile = "memory_squeezer.log"
LogLevel = "INFO"
"#,
    )
    .expect("write");
    let from_file = SqueezerConfig::load(&explicit).expect("explicit");
    assert_eq!(from_file, reloaded);
    assert_eq!(
        from_file.settings.run_config().expect("valid"),
        SqueezerConfig::default().settings.run_config().expect("valid")
    );
}

#[test]
fn missing_keys_fall_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("partial.toml");
    std::fs::write(
        &path,
        "[Settings]\nMemoryLimit = 512\n\n[Theme]\nTheme = \"dark\"\n",
    )
    .expect("write");
    let cfg = SqueezerConfig::load(&path).expect("load");
    assert_eq!(cfg.settings.memory_limit, 512);
    assert_eq!(cfg.settings.block_size, 10);
    assert_eq!(cfg.theme.theme, ThemeName::Dark);
    assert_eq!(cfg.window.width, 600);
}

#[test]
fn unparseable_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[Settings]\nBlockSize = \"ten\"\n").expect("write");
    assert!(SqueezerConfig::load_or_create(&path).is_err());
}

#[test]
fn run_config_converts_units() {
    let cfg = SqueezerConfig::default().settings.run_config().expect("valid");
    assert_eq!(cfg.block_size, 10 * MIB);
    assert_eq!(cfg.memory_limit, 256 * MIB);
    assert_eq!(cfg.allocations_per_second, 500);
    assert_eq!(cfg.interval(), Some(std::time::Duration::from_millis(2)));
    assert!(cfg.virtual_memory_limit.is_none());
    assert!(cfg.workers.is_none());
    assert!((cfg.used_percent_ceiling() - 98.0).abs() < f64::EPSILON);

    let mut settings = SqueezerConfig::default().settings;
    settings.use_multiprocessing = true;
    settings.squeeze_virtual_memory = true;
    let cfg = settings.run_config().expect("valid");
    assert_eq!(cfg.workers, Some(4));
    assert_eq!(cfg.virtual_memory_limit, Some(1024 * MIB));
}

#[test]
fn progress_bar_color_parses_or_defaults() {
    let t = Theme { progress_bar_color: "10, 20,30".into(), ..Theme::default() };
    assert_eq!(t.progress_bar_rgb(), (10, 20, 30));
    for bad in ["", "1,2", "1,2,3,4", "300,0,0", "a,b,c"] {
        let t = Theme { progress_bar_color: bad.into(), ..Theme::default() };
        assert_eq!(t.progress_bar_rgb(), Theme::DEFAULT_RGB, "{bad}");
    }
}

#[test]
fn log_level_names() {
    let lvl = |s: &str| Logging { log_level: s.into(), ..Logging::default() }.filter_directive();
    assert_eq!(lvl("INFO"), "info");
    assert_eq!(lvl("warning"), "warn");
    assert_eq!(lvl("CRITICAL"), "error");
    assert_eq!(lvl("debug"), "debug");
    assert_eq!(lvl("nonsense"), "info");
}

#[test]
fn display_view() {
    let d = SqueezerConfig::default().display();
    assert_eq!((d.width, d.height), (600, 500));
    assert_eq!(d.theme, ThemeName::Light);
    assert_eq!(d.progress_bar_rgb, (0, 128, 255));
}
