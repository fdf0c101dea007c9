use ringside_lib::settings::FrontendSettings;
use ringside_lib::errors::SettingsError;

#[test]
fn settings_roundtrip_through_toml() {
  let dir  = tempfile::tempdir().expect("no tempdir");
  let path = dir.path().join("ringside-config-test.toml");
  let path = path.to_str().unwrap();

  let mut settings = FrontendSettings::new();
  settings.n_links         = 2;
  settings.boards_per_link = 2;
  settings.boards = vec![ringside_lib::settings::BoardSettings::new(); 4];
  settings.ts_match_thresh_ticks = 77;
  settings.to_toml(path).expect("writing failed");

  let read_back = FrontendSettings::from_toml(path).expect("reading failed");
  assert_eq!(read_back.n_links, 2);
  assert_eq!(read_back.boards.len(), 4);
  assert_eq!(read_back.ts_match_thresh_ticks, 77);
  read_back.validate().expect("round-tripped settings invalid");
}

#[test]
fn trigger_box_requires_merging() {
  let mut settings = FrontendSettings::new();
  settings.trigger_box.enable_trigger_box = true;
  settings.merge_data_from_boards         = false;
  assert_eq!(settings.validate().unwrap_err(),
             SettingsError::InvalidCombination);
}

#[test]
fn board_sections_must_match_the_topology() {
  let mut settings = FrontendSettings::new();
  settings.n_links = 2;
  assert_eq!(settings.validate().unwrap_err(),
             SettingsError::InvalidCombination);
}
