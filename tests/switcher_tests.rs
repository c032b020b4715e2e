use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_switcher::backend::MockGpioBackend;
use relay_switcher::config::{AppSettings, EdgeDetect, MirrorTarget, PinLevel};
use relay_switcher::error::AppError;
use relay_switcher::gpio::{EdgeEvent, GpioBackend};
use relay_switcher::hub::{NotificationSink, SystemState};
use relay_switcher::switcher::SwitcherState;

#[derive(Default)]
struct RecordingSink {
    states: Mutex<Vec<SystemState>>,
    settings: Mutex<Vec<AppSettings>>,
    mirrors: Mutex<Vec<(MirrorTarget, String)>>,
}

impl NotificationSink for RecordingSink {
    fn publish_state(&self, state: &SystemState) {
        self.states.lock().unwrap().push(state.clone());
    }

    fn publish_settings(&self, settings: &AppSettings) {
        self.settings.lock().unwrap().push(settings.clone());
    }

    fn send_mirror(&self, target: MirrorTarget, message: String) {
        self.mirrors.lock().unwrap().push((target, message));
    }
}

fn settings(json: &str) -> AppSettings {
    AppSettings::from_json_str(json).expect("valid test config")
}

const TWO_MICS_ONE_OUTPUT: &str = r#"{
    "routes": [
        { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5, "activeLow": true },
        { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 6, "activeLow": true }
    ]
}"#;

const TWO_MICS_TWO_OUTPUTS: &str = r#"{
    "routes": [
        { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 },
        { "sourceName": "Mic1", "outputName": "Booth", "relayPin": 7 },
        { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 6 },
        { "sourceName": "Mic2", "outputName": "Booth", "relayPin": 8 }
    ]
}"#;

fn start(
    json: &str,
) -> (
    SwitcherState,
    Arc<MockGpioBackend>,
    Arc<RecordingSink>,
) {
    let mock = Arc::new(MockGpioBackend::default());
    let sink = Arc::new(RecordingSink::default());
    let backend: Arc<dyn GpioBackend> = mock.clone();
    let switcher = SwitcherState::new(settings(json), backend, sink.clone()).expect("switcher starts");
    (switcher, mock, sink)
}

fn active_pins(mock: &MockGpioBackend, pins: &[u32]) -> usize {
    // every relay in these configs is active low
    pins.iter()
        .filter(|p| mock.level(**p) == Some(PinLevel::Low))
        .count()
}

#[test]
fn single_output_switch_drives_only_the_selected_relay() {
    let (switcher, mock, _) = start(TWO_MICS_ONE_OUTPUT);
    assert_eq!(mock.level(5), Some(PinLevel::High));
    assert_eq!(mock.level(6), Some(PinLevel::High));

    switcher.switch_source("Mic2", "Studio").unwrap();

    assert_eq!(mock.level(5), Some(PinLevel::High));
    assert_eq!(mock.level(6), Some(PinLevel::Low));
    let state = switcher.system_state();
    assert_eq!(state["Mic1"], "");
    assert_eq!(state["Mic2"], "Studio");

    switcher.switch_source("Mic1", "Studio").unwrap();
    assert_eq!(mock.level(5), Some(PinLevel::Low));
    assert_eq!(mock.level(6), Some(PinLevel::High));
}

#[test]
fn at_most_one_output_per_source_and_one_source_per_output() {
    let (switcher, mock, _) = start(TWO_MICS_TWO_OUTPUTS);

    let steps = [
        ("Mic1", "Studio"),
        ("Mic1", "Booth"),
        ("Mic2", "Booth"),
        ("Mic2", "Studio"),
        ("Mic1", "Studio"),
    ];
    for (source, output) in steps {
        switcher.switch_source(source, output).unwrap();
        assert!(active_pins(&mock, &[5, 7]) <= 1, "Mic1 after {source}->{output}");
        assert!(active_pins(&mock, &[6, 8]) <= 1, "Mic2 after {source}->{output}");
        assert!(active_pins(&mock, &[5, 6]) <= 1, "Studio after {source}->{output}");
        assert!(active_pins(&mock, &[7, 8]) <= 1, "Booth after {source}->{output}");
    }

    let state = switcher.system_state();
    assert_eq!(state["Mic1"], "Studio");
    assert_eq!(state["Mic2"], "");
}

#[test]
fn unknown_pairs_are_ignored_or_rejected() {
    let (switcher, mock, _) = start(TWO_MICS_ONE_OUTPUT);
    switcher.switch_source("Mic1", "Studio").unwrap();

    switcher.switch_source("Mic1", "Booth").unwrap();
    assert_eq!(mock.level(5), Some(PinLevel::Low));

    let err = switcher.switch_route("Mic3", "Studio").unwrap_err();
    assert!(matches!(err, AppError::NotFoundRoute(_)));

    switcher.switch_route("mic2", "STUDIO").unwrap();
    assert_eq!(switcher.system_state()["Mic2"], "Studio");
}

#[test]
fn conflicting_default_routes_keep_the_first_entry() {
    let (switcher, mock, _) = start(
        r#"{
            "routes": [
                { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 },
                { "sourceName": "Mic1", "outputName": "Booth", "relayPin": 7 },
                { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 6 },
                { "sourceName": "Mic2", "outputName": "Booth", "relayPin": 8 }
            ],
            "defaultRoutes": { "Mic1": "Studio", "Mic2": "Studio" }
        }"#,
    );

    let state = switcher.system_state();
    assert_eq!(state["Mic1"], "Studio");
    assert_eq!(state["Mic2"], "");
    assert_eq!(mock.level(5), Some(PinLevel::Low));
    assert_eq!(mock.level(6), Some(PinLevel::High));
}

#[test]
fn default_source_uses_its_first_route() {
    let (switcher, _, _) = start(
        r#"{
            "routes": [
                { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 },
                { "sourceName": "Mic2", "outputName": "Booth", "relayPin": 6 },
                { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 8 }
            ],
            "defaultSource": "Mic2"
        }"#,
    );

    assert_eq!(switcher.system_state()["Mic2"], "Booth");
}

#[test]
fn invalid_configuration_claims_nothing() {
    let mock = Arc::new(MockGpioBackend::default());
    let backend: Arc<dyn GpioBackend> = mock.clone();
    let invalid = settings(
        r#"{ "routes": [ { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 41 } ] }"#,
    );

    let result = SwitcherState::new(invalid, backend, Arc::new(RecordingSink::default()));
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert!(mock.open_pins().is_empty());
    assert_eq!(mock.open_count(41), 0);
}

#[test]
fn failed_claim_releases_every_line() {
    let mock = Arc::new(MockGpioBackend::default());
    mock.fail_open(6);
    let backend: Arc<dyn GpioBackend> = mock.clone();

    let result = SwitcherState::new(
        settings(TWO_MICS_ONE_OUTPUT),
        backend,
        Arc::new(RecordingSink::default()),
    );
    assert!(matches!(result, Err(AppError::Gpio(_))));
    assert!(mock.open_pins().is_empty());
    assert_eq!(mock.open_count(5), 1);
    assert_eq!(mock.close_count(5), 1);
}

#[test]
fn invalid_settings_leave_the_running_configuration_alone() {
    let (switcher, mock, sink) = start(TWO_MICS_ONE_OUTPUT);
    switcher.switch_source("Mic2", "Studio").unwrap();

    let err = switcher
        .apply_settings(settings(
            r#"{ "routes": [ { "sourceName": "Mic1", "outputName": "", "relayPin": 5 } ] }"#,
        ))
        .unwrap_err();

    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(switcher.settings().routes.len(), 2);
    assert_eq!(switcher.system_state()["Mic2"], "Studio");
    assert_eq!(mock.open_count(5), 1);
    assert_eq!(mock.close_count(5), 0);
    assert!(sink.settings.lock().unwrap().is_empty());
}

#[test]
fn failed_reconfiguration_restores_previous_routing() {
    let (switcher, mock, sink) = start(TWO_MICS_ONE_OUTPUT);
    switcher.switch_source("Mic2", "Studio").unwrap();
    mock.fail_open(9);

    let err = switcher
        .apply_settings(settings(
            r#"{
                "routes": [
                    { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 },
                    { "sourceName": "Mic3", "outputName": "Studio", "relayPin": 9 }
                ]
            }"#,
        ))
        .unwrap_err();

    assert!(matches!(err, AppError::Gpio(_)));
    let current = switcher.settings();
    assert_eq!(current.sources(), vec!["Mic1".to_string(), "Mic2".to_string()]);
    assert_eq!(mock.open_pins(), vec![5, 6]);
    assert_eq!(mock.level(6), Some(PinLevel::Low));
    assert_eq!(switcher.system_state()["Mic2"], "Studio");
    assert!(sink.settings.lock().unwrap().is_empty());

    mock.clear_failures();
    switcher
        .apply_settings(settings(
            r#"{
                "routes": [
                    { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 },
                    { "sourceName": "Mic3", "outputName": "Studio", "relayPin": 9 }
                ]
            }"#,
        ))
        .unwrap();
    assert_eq!(mock.open_pins(), vec![5, 9]);
    assert_eq!(mock.close_count(6), 2);
    assert_eq!(sink.settings.lock().unwrap().len(), 1);
}

#[test]
fn inactive_relay_follows_the_lifecycle() {
    let (switcher, mock, _) = start(
        r#"{
            "routes": [ { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 } ],
            "inactiveRelay": { "pin": 12, "inactiveState": "High" }
        }"#,
    );
    assert_eq!(mock.level(12), Some(PinLevel::Low));

    switcher.set_inactive_relay_to_inactive_state();
    switcher.set_inactive_relay_to_inactive_state();
    assert_eq!(mock.level(12), Some(PinLevel::High));
    assert_eq!(mock.write_count(12), 1);

    switcher.shutdown();
    assert!(switcher.is_disposed());
    assert!(mock.open_pins().is_empty());
    assert_eq!(mock.level(12), Some(PinLevel::High));
    assert_eq!(mock.write_count(12), 1);
    assert_eq!(mock.close_count(12), 1);

    // safe after teardown too
    switcher.set_inactive_relay_to_inactive_state();
    switcher.shutdown();
    drop(switcher);
    assert_eq!(mock.write_count(12), 1);
    assert_eq!(mock.close_count(12), 1);
    assert_eq!(mock.close_count(5), 1);
}

const RELAY_AND_BUTTON: &str = r#"{
    "routes": [ { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 } ],
    "physicalSourceButtons": { "Mic1": { "pinNumber": 17 } },
    "inactiveRelay": { "pin": 12, "inactiveLevel": "High" }
}"#;

#[test]
fn shutdown_drives_inactive_relay_inactive_once() {
    let (switcher, mock, _) = start(RELAY_AND_BUTTON);

    switcher.shutdown();
    assert_eq!(mock.level(12), Some(PinLevel::High));
    assert_eq!(mock.write_count(12), 1);
    drop(switcher);
    assert_eq!(mock.write_count(12), 1);
}

#[test]
fn failed_start_leaves_inactive_relay_inactive() {
    let mock = Arc::new(MockGpioBackend::default());
    mock.fail_open(17);
    let backend: Arc<dyn GpioBackend> = mock.clone();

    let result = SwitcherState::new(
        settings(RELAY_AND_BUTTON),
        backend,
        Arc::new(RecordingSink::default()),
    );
    assert!(matches!(result, Err(AppError::Gpio(_))));
    assert!(mock.open_pins().is_empty());
    assert_eq!(mock.level(12), Some(PinLevel::High));
    assert_eq!(mock.close_count(12), 1);
}

#[test]
fn failed_reconfiguration_leaves_new_inactive_relay_inactive() {
    let (switcher, mock, _) = start(TWO_MICS_ONE_OUTPUT);
    mock.fail_open(17);

    let err = switcher.apply_settings(settings(RELAY_AND_BUTTON)).unwrap_err();
    assert!(matches!(err, AppError::Gpio(_)));
    assert_eq!(mock.level(12), Some(PinLevel::High));
    assert_eq!(mock.open_pins(), vec![5, 6]);
}

#[test]
fn reconfiguration_cycles_the_inactive_relay() {
    let (switcher, mock, _) = start(RELAY_AND_BUTTON);

    switcher.apply_settings(settings(RELAY_AND_BUTTON)).unwrap();
    assert_eq!(mock.write_count(12), 1);
    assert_eq!(mock.close_count(12), 1);
    assert_eq!(mock.level(12), Some(PinLevel::Low));
}

#[test]
fn operations_after_shutdown_fail() {
    let (switcher, _, _) = start(TWO_MICS_ONE_OUTPUT);
    switcher.shutdown();

    assert!(matches!(
        switcher.switch_source("Mic1", "Studio"),
        Err(AppError::InvalidState(_))
    ));
    assert!(matches!(
        switcher.apply_settings(settings(TWO_MICS_ONE_OUTPUT)),
        Err(AppError::InvalidState(_))
    ));
    assert!(switcher.system_state().is_empty());
}

#[test]
fn dropping_the_switcher_releases_all_lines() {
    let (switcher, mock, _) = start(TWO_MICS_TWO_OUTPUTS);
    assert_eq!(mock.open_pins(), vec![5, 6, 7, 8]);

    drop(switcher);
    assert!(mock.open_pins().is_empty());
    for pin in [5, 6, 7, 8] {
        assert_eq!(mock.open_count(pin), 1);
        assert_eq!(mock.close_count(pin), 1);
    }
}

#[test]
fn button_edges_are_debounced() {
    let (switcher, _, _) = start(
        r#"{
            "routes": [
                { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 },
                { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 6 }
            ],
            "physicalSourceButtons": { "Mic1": { "pinNumber": 17, "triggerLevel": "Low" } }
        }"#,
    );
    let edge = |timestamp_ms| EdgeEvent {
        pin_id: 17,
        edge: EdgeDetect::Falling,
        timestamp_ms,
    };

    assert!(switcher.handle_button_edge(&edge(1_000)));
    assert_eq!(switcher.system_state()["Mic1"], "Studio");

    switcher.switch_source("Mic2", "Studio").unwrap();
    assert!(!switcher.handle_button_edge(&edge(1_150)));
    assert_eq!(switcher.system_state()["Mic2"], "Studio");

    assert!(switcher.handle_button_edge(&edge(1_250)));
    assert_eq!(switcher.system_state()["Mic1"], "Studio");

    let unbound = EdgeEvent {
        pin_id: 30,
        edge: EdgeDetect::Falling,
        timestamp_ms: 5_000,
    };
    assert!(!switcher.handle_button_edge(&unbound));
}

#[test]
fn button_ignores_the_release_edge() {
    let (switcher, _, _) = start(
        r#"{
            "routes": [ { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 } ],
            "physicalSourceButtons": { "mic1": { "pinNumber": 17, "triggerLevel": "High" } }
        }"#,
    );

    let released = EdgeEvent {
        pin_id: 17,
        edge: EdgeDetect::Falling,
        timestamp_ms: 1_000,
    };
    assert!(!switcher.handle_button_edge(&released));
    assert_eq!(switcher.system_state()["Mic1"], "");
}

#[actix_rt::test]
async fn physical_button_press_switches_source() {
    let mock = Arc::new(MockGpioBackend::default());
    let backend: Arc<dyn GpioBackend> = mock.clone();
    let switcher = Arc::new(
        SwitcherState::new(
            settings(
                r#"{
                    "routes": [
                        { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 },
                        { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 6 }
                    ],
                    "defaultSource": "Mic1",
                    "physicalSourceButtons": { "Mic2": { "pinNumber": 17 } }
                }"#,
            ),
            backend,
            Arc::new(RecordingSink::default()),
        )
        .unwrap(),
    );
    tokio::spawn(switcher.clone().dispatch_button_events());
    assert_eq!(switcher.system_state()["Mic1"], "Studio");

    // idle high, pressed pulls the line low
    mock.simulate_input(17, PinLevel::Low).unwrap();

    let mut switched = false;
    for _ in 0..50 {
        if switcher.system_state()["Mic2"] == "Studio" {
            switched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(switched, "button press should select Mic2");
    assert_eq!(mock.level(5), Some(PinLevel::High));
}

#[test]
fn mirror_message_is_sent_on_activation() {
    let (switcher, _, sink) = start(
        r#"{
            "tcpMirrorAddress": "127.0.0.1",
            "tcpMirrorPort": 9100,
            "routes": [
                { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5, "tcpMessage": "CAM1" },
                { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 6 }
            ]
        }"#,
    );

    switcher.switch_source("Mic1", "Studio").unwrap();
    switcher.switch_source("Mic2", "Studio").unwrap();

    let mirrors = sink.mirrors.lock().unwrap();
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors[0].0.to_string(), "127.0.0.1:9100");
    assert_eq!(mirrors[0].1, "CAM1");

    let states = sink.states.lock().unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[1]["Mic2"], "Studio");
}

#[test]
fn default_routes_send_their_mirror_messages() {
    const MIRRORED_DEFAULTS: &str = r#"{
        "tcpMirrorAddress": "127.0.0.1",
        "tcpMirrorPort": 9100,
        "routes": [
            { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5, "mirrorMessage": "CAM1" },
            { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 6, "mirrorMessage": "CAM2" }
        ],
        "defaultSource": "Mic1"
    }"#;
    let (switcher, _, sink) = start(MIRRORED_DEFAULTS);
    assert_eq!(sink.mirrors.lock().unwrap().len(), 1);
    assert_eq!(sink.mirrors.lock().unwrap()[0].1, "CAM1");

    switcher
        .apply_settings(settings(&MIRRORED_DEFAULTS.replace(
            r#""defaultSource": "Mic1""#,
            r#""defaultRoutes": { "Mic2": "Studio" }"#,
        )))
        .unwrap();
    let mirrors = sink.mirrors.lock().unwrap();
    assert_eq!(mirrors.len(), 2);
    assert_eq!(mirrors[1].1, "CAM2");
}

#[test]
fn test_pin_claims_free_lines_until_reconfiguration() {
    let (switcher, mock, _) = start(TWO_MICS_ONE_OUTPUT);

    switcher.test_pin(20, false, true).unwrap();
    assert_eq!(mock.level(20), Some(PinLevel::High));
    switcher.test_pin(20, false, false).unwrap();
    assert_eq!(mock.level(20), Some(PinLevel::Low));
    assert_eq!(mock.open_count(20), 1);

    // relay lines are driven in place
    switcher.test_pin(5, true, true).unwrap();
    assert_eq!(mock.level(5), Some(PinLevel::Low));

    switcher.apply_settings(settings(TWO_MICS_ONE_OUTPUT)).unwrap();
    assert_eq!(mock.close_count(20), 1);
    assert_eq!(mock.open_pins(), vec![5, 6]);
}
