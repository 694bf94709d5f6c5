use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::FormField;
use super::config::PairingConfig;
use super::config::PairingForm;
use super::config::PairingId;
use super::controller::PairingController;
use super::controller::PairingError;
use super::controller::TurnOnOutcome;
use super::controller::WaitPolicy;
use super::device::Activation;
use super::device::Brightness;
use super::device::Color;
use super::device::ColorMode;
use super::device::DeviceCommand;
use super::device::DeviceError;
use super::device::DeviceId;
use super::device::DevicePower;
use super::device::DeviceState;
use super::device::Power;
use super::device::SupportedFeatures;
use super::device::XyColor;
use super::entity::PairingEntity;
use super::registry::PairingRegistry;
use super::registry::RegistryError;
use super::testing::Command;
use super::testing::FakeHost;

const PHYSICAL: &str = "switch.lamp1";
const SMART: &str = "light.lamp1";

fn lamp_config(brightness_on_switch: u8, turn_off_physical_on_off: bool) -> PairingConfig {
    PairingConfig {
        id: PairingId::from("lamp1"),
        name: "Lamp".to_string(),
        physical_device: DeviceId::from(PHYSICAL),
        smart_device: DeviceId::from(SMART),
        brightness_on_switch,
        turn_off_physical_on_off,
    }
}

fn controller(
    host: &Arc<FakeHost>,
    config: PairingConfig,
) -> Arc<PairingController<FakeHost>> {
    Arc::new(PairingController::new(
        config,
        host.clone(),
        WaitPolicy::default(),
    ))
}

fn host(physical: DevicePower, smart: DevicePower) -> Arc<FakeHost> {
    Arc::new(
        FakeHost::new()
            .with_device(PHYSICAL, physical)
            .with_device(SMART, smart),
    )
}

fn set_power(id: &str, power: Power) -> Command {
    Command::SetPower(DeviceId::from(id), power)
}

fn activate(activation: Activation) -> Command {
    Command::Activate(DeviceId::from(SMART), activation)
}

#[tokio::test]
async fn test_smart_reachable_immediately_uses_configured_brightness() {
    let host = host(DevicePower::Off, DevicePower::Off);
    let pairing = controller(&host, lamp_config(80, true));

    let outcome = pairing.turn_on(Activation::on()).await.unwrap();

    assert_eq!(outcome, TurnOnOutcome::Activated);
    assert_eq!(
        host.commands(),
        vec![
            set_power(PHYSICAL, Power::On),
            activate(Activation::on().brightness(Brightness::Percent(80))),
        ]
    );
    assert!(pairing.is_on());
    assert!(!pairing.is_awaiting_smart_device());

    let snapshot = pairing.snapshot();
    assert_eq!(snapshot.revision, 1);
    assert!(snapshot.state.is_on);
}

#[tokio::test]
async fn test_explicit_brightness_wins() {
    let host = host(DevicePower::Off, DevicePower::Off);
    let pairing = controller(&host, lamp_config(80, true));

    pairing
        .turn_on(Activation::on().brightness(Brightness::Percent(40)))
        .await
        .unwrap();

    assert_eq!(
        host.commands_to(SMART),
        vec![activate(Activation::on().brightness(Brightness::Percent(40)))]
    );
}

#[tokio::test]
async fn test_explicit_color_is_forwarded_alone() {
    let host = host(DevicePower::On, DevicePower::On);
    let pairing = controller(&host, lamp_config(80, false));
    let request = Activation::on().color(Color::Xy(XyColor { x: 0.3, y: 0.4 }));

    pairing.turn_on(request).await.unwrap();

    assert_eq!(host.commands(), vec![activate(request)]);
}

#[tokio::test]
async fn test_physical_already_on_is_not_commanded() {
    let host = host(DevicePower::On, DevicePower::Off);
    let pairing = controller(&host, lamp_config(0, false));

    pairing.turn_on(Activation::on()).await.unwrap();

    assert_eq!(host.commands(), vec![activate(Activation::on())]);
}

#[tokio::test]
async fn test_turn_on_then_off_leaves_pairing_off() {
    let host = host(DevicePower::Off, DevicePower::Off);
    let pairing = controller(&host, lamp_config(100, false));

    pairing.turn_on(Activation::on()).await.unwrap();
    pairing.turn_off().await.unwrap();

    assert!(!pairing.is_on());
    assert!(!pairing.snapshot().state.is_on);
    assert_eq!(pairing.snapshot().revision, 2);
}

#[tokio::test]
async fn test_turn_off_without_cascade_leaves_physical_alone() {
    let host = host(DevicePower::On, DevicePower::On);
    let pairing = controller(&host, lamp_config(100, false));

    pairing.turn_off().await.unwrap();

    assert_eq!(host.commands(), vec![set_power(SMART, Power::Off)]);
    assert!(host.commands_to(PHYSICAL).is_empty());
}

#[tokio::test]
async fn test_turn_off_with_cascade() {
    let host = host(DevicePower::On, DevicePower::On);
    let pairing = controller(&host, lamp_config(100, true));

    pairing.turn_off().await.unwrap();

    assert_eq!(
        host.commands(),
        vec![set_power(SMART, Power::Off), set_power(PHYSICAL, Power::Off)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_physical_switched_off_during_wait_aborts() {
    let host = host(DevicePower::Off, DevicePower::Unreachable);
    // Initial read, then the first poll sees it switched off externally
    host.script(PHYSICAL, [DevicePower::Off, DevicePower::Off]);
    let pairing = controller(&host, lamp_config(80, true));

    let outcome = pairing.turn_on(Activation::on()).await.unwrap();

    assert_eq!(outcome, TurnOnOutcome::PhysicalSwitchedOff);
    assert_eq!(host.commands(), vec![set_power(PHYSICAL, Power::On)]);
    assert!(host.commands_to(SMART).is_empty());
    assert!(!pairing.is_on());
    assert!(!pairing.is_awaiting_smart_device());
    assert_eq!(pairing.snapshot().revision, 0);
}

#[tokio::test(start_paused = true)]
async fn test_smart_becomes_reachable_after_polling() {
    let host = host(DevicePower::Off, DevicePower::Unreachable);
    host.script(
        SMART,
        [
            DevicePower::Unreachable,
            DevicePower::Unreachable,
            DevicePower::Off,
        ],
    );
    let pairing = controller(&host, lamp_config(50, false));

    let outcome = pairing.turn_on(Activation::on()).await.unwrap();

    assert_eq!(outcome, TurnOnOutcome::Activated);
    assert_eq!(
        host.commands_to(SMART),
        vec![activate(Activation::on().brightness(Brightness::Percent(50)))]
    );
    assert!(pairing.is_on());
}

#[tokio::test(start_paused = true)]
async fn test_turn_off_cancels_pending_wait() {
    let host = host(DevicePower::Off, DevicePower::Unreachable);
    let pairing = controller(&host, lamp_config(80, false));

    let waiting = tokio::spawn({
        let pairing = pairing.clone();
        async move { pairing.turn_on(Activation::on()).await }
    });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(pairing.is_awaiting_smart_device());

    pairing.turn_off().await.unwrap();
    let outcome = waiting.await.unwrap().unwrap();

    assert_eq!(outcome, TurnOnOutcome::Cancelled);
    assert!(!host
        .commands()
        .iter()
        .any(|c| matches!(c, Command::Activate(..))));
    assert!(!pairing.is_on());
    assert!(!pairing.is_awaiting_smart_device());

    // The late smart device must not flip the pairing back on
    host.set_state(SMART, DeviceState::with_power(DevicePower::Off));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!pairing.is_on());
}

#[tokio::test(start_paused = true)]
async fn test_turn_off_while_smart_unreachable_still_cascades() {
    let host = host(DevicePower::Off, DevicePower::Unreachable);
    let pairing = controller(&host, lamp_config(80, true));

    let waiting = tokio::spawn({
        let pairing = pairing.clone();
        async move { pairing.turn_on(Activation::on()).await }
    });
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(pairing.is_awaiting_smart_device());

    pairing.turn_off().await.unwrap();

    assert_eq!(waiting.await.unwrap().unwrap(), TurnOnOutcome::Cancelled);
    assert_eq!(
        host.commands(),
        vec![set_power(PHYSICAL, Power::On), set_power(PHYSICAL, Power::Off)]
    );
    assert!(!pairing.is_awaiting_smart_device());
    assert!(!pairing.is_on());
    assert_eq!(pairing.snapshot().revision, 1);
}

#[tokio::test]
async fn test_host_refuses_commands_to_unreachable_device() {
    let host = host(DevicePower::Off, DevicePower::Unreachable);

    let result = host.activate(&DeviceId::from(SMART), Activation::on()).await;

    assert_eq!(result, Err(DeviceError::Unreachable(DeviceId::from(SMART))));
    assert!(host.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out() {
    let host = host(DevicePower::On, DevicePower::Unreachable);
    let pairing = Arc::new(PairingController::new(
        lamp_config(80, false),
        host.clone(),
        WaitPolicy {
            timeout: Duration::from_secs(5),
            ..WaitPolicy::default()
        },
    ));

    let err = pairing.turn_on(Activation::on()).await.unwrap_err();

    assert_eq!(
        err,
        PairingError::DeviceUnreachable {
            device: DeviceId::from(SMART),
            timed_out: true,
        }
    );
    assert!(host.commands().is_empty());
    assert!(!pairing.is_awaiting_smart_device());
    assert!(!pairing.is_on());
}

#[tokio::test]
async fn test_unreachable_physical_fails_without_state_change() {
    let host = host(DevicePower::Off, DevicePower::Off);
    host.fail_commands_to(PHYSICAL);
    let pairing = controller(&host, lamp_config(80, false));

    let err = pairing.turn_on(Activation::on()).await.unwrap_err();

    assert_eq!(
        err,
        PairingError::DeviceUnreachable {
            device: DeviceId::from(PHYSICAL),
            timed_out: false,
        }
    );
    assert!(!pairing.is_awaiting_smart_device());
    assert_eq!(pairing.snapshot().revision, 0);
}

#[tokio::test]
async fn test_failed_turn_off_keeps_power() {
    let host = host(DevicePower::On, DevicePower::On);
    let pairing = controller(&host, lamp_config(80, false));
    pairing.turn_on(Activation::on()).await.unwrap();

    host.reject_commands_to(SMART);
    assert!(matches!(
        pairing.turn_off().await,
        Err(PairingError::Device(DeviceError::Rejected { .. }))
    ));

    assert!(pairing.is_on());
    assert_eq!(pairing.snapshot().revision, 1);
}

#[tokio::test]
async fn test_refresh_mirrors_smart_device() {
    let host = host(DevicePower::On, DevicePower::Off);
    let pairing = controller(&host, lamp_config(80, false));

    let snapshot = pairing.refresh_state().await.unwrap();
    assert!(!snapshot.state.is_on);
    assert_eq!(
        snapshot.state.supported_color_modes,
        BTreeSet::from([ColorMode::ColorTemp, ColorMode::Xy])
    );
    assert_eq!(snapshot.state.supported_features, SupportedFeatures::default());

    host.set_state(
        SMART,
        DeviceState {
            power: DevicePower::On,
            brightness: Some(200),
            color_temp: Some(370),
            color_mode: Some(ColorMode::ColorTemp),
            supported_color_modes: Some(BTreeSet::from([ColorMode::ColorTemp])),
            supported_features: Some(SupportedFeatures::BRIGHTNESS),
            ..DeviceState::default()
        },
    );
    let snapshot = pairing.refresh_state().await.unwrap();
    assert!(snapshot.state.is_on);
    assert_eq!(snapshot.state.brightness, Some(200));
    assert_eq!(snapshot.state.color_temp, Some(370));
    assert_eq!(
        snapshot.state.supported_color_modes,
        BTreeSet::from([ColorMode::ColorTemp])
    );

    // Switching off keeps the last mirrored attributes
    host.set_state(SMART, DeviceState::with_power(DevicePower::Off));
    let snapshot = pairing.refresh_state().await.unwrap();
    assert!(!snapshot.state.is_on);
    assert_eq!(snapshot.state.brightness, Some(200));
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let host = host(DevicePower::On, DevicePower::On);
    let pairing = controller(&host, lamp_config(80, false));

    let first = pairing.refresh_state().await.unwrap();
    let second = pairing.refresh_state().await.unwrap();

    assert_eq!(first.state, second.state);
    assert_eq!(second.revision, first.revision + 1);
}

#[tokio::test]
async fn test_reconfigure_is_picked_up_by_next_turn_on() {
    let host = host(DevicePower::On, DevicePower::On);
    let pairing = controller(&host, lamp_config(80, false));

    pairing.reconfigure(lamp_config(30, true));
    pairing.turn_on(Activation::on()).await.unwrap();
    pairing.turn_off().await.unwrap();

    assert_eq!(
        host.commands(),
        vec![
            activate(Activation::on().brightness(Brightness::Percent(30))),
            set_power(SMART, Power::Off),
            set_power(PHYSICAL, Power::Off),
        ]
    );
}

#[tokio::test]
async fn test_entity_refreshes_on_paired_device_change() {
    let host = host(DevicePower::On, DevicePower::Off);
    let pairing = controller(&host, lamp_config(80, false));
    let entity = PairingEntity::new(pairing.clone(), host.clone());

    let initial = entity.activate().await.unwrap();
    assert!(!initial.state.is_on);
    assert!(entity.is_active());

    let mut updates = pairing.subscribe();
    updates.borrow_and_update();
    host.set_state(
        SMART,
        DeviceState {
            power: DevicePower::On,
            brightness: Some(128),
            ..DeviceState::default()
        },
    );

    tokio::time::timeout(Duration::from_secs(1), updates.changed())
        .await
        .unwrap()
        .unwrap();
    let state = entity.state();
    assert!(state.is_on);
    assert_eq!(state.brightness, Some(128));
}

#[tokio::test]
async fn test_entity_deactivate_drops_subscription() {
    let host = host(DevicePower::On, DevicePower::Off);
    let entity = PairingEntity::new(controller(&host, lamp_config(80, false)), host.clone());

    entity.activate().await.unwrap();
    assert_eq!(host.subscriber_count(), 1);

    entity.deactivate();
    for _ in 0..10 {
        if host.subscriber_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!entity.is_active());
    assert_eq!(host.subscriber_count(), 0);
}

#[tokio::test]
async fn test_entity_device_info() {
    let host = host(DevicePower::On, DevicePower::Off);
    let entity = PairingEntity::new(controller(&host, lamp_config(80, false)), host.clone());

    let info = entity.device_info();
    assert_eq!(info.identifiers, vec!["lamp1".to_string()]);
    assert_eq!(info.name, "Lamp");
    assert_eq!(info.manufacturer, "Virtual Light Manufacturer");
    assert_eq!(info.model, "Virtual Light Model");
    assert_eq!(info.sw_version, "1.0");
}

#[tokio::test]
async fn test_registry_lifecycle() {
    let host = host(DevicePower::On, DevicePower::On);
    let registry = PairingRegistry::new(host.clone(), WaitPolicy::default());
    let form = PairingForm::new("Lamp", PHYSICAL, SMART).brightness_on_switch(80);

    let entity = registry
        .create(PairingId::from("lamp1"), &form)
        .await
        .unwrap();
    assert!(entity.is_active());
    assert!(entity.state().is_on);

    let duplicate = registry.create(PairingId::from("lamp1"), &form).await;
    assert!(matches!(duplicate, Err(RegistryError::DuplicateId(_))));

    let config = registry
        .reconfigure(
            &PairingId::from("lamp1"),
            &form.clone().brightness_on_switch(10).turn_off_physical_on_off(true),
        )
        .await
        .unwrap();
    assert_eq!(config.brightness_on_switch, 10);
    assert!(config.turn_off_physical_on_off);

    registry.remove(&PairingId::from("lamp1")).await.unwrap();
    assert!(registry.get(&PairingId::from("lamp1")).await.is_none());
    assert!(!entity.is_active());
    assert!(matches!(
        registry.remove(&PairingId::from("lamp1")).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_registry_rejects_invalid_forms() {
    let host = Arc::new(
        FakeHost::new()
            .with_device(PHYSICAL, DevicePower::On)
            .with_device(SMART, DevicePower::On)
            .with_device("light.other", DevicePower::On),
    );
    let registry = PairingRegistry::new(host.clone(), WaitPolicy::default());

    let missing = PairingForm::new("Lamp", PHYSICAL, "light.missing");
    match registry.create(PairingId::from("p"), &missing).await {
        Err(RegistryError::Configuration(e)) => assert_eq!(e.field, FormField::SmartDevice),
        other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
    }
    assert!(registry.list().await.is_empty());
    assert_eq!(host.subscriber_count(), 0);

    let form = PairingForm::new("Lamp", PHYSICAL, SMART);
    registry.create(PairingId::from("p"), &form).await.unwrap();

    let moved = PairingForm::new("Lamp", PHYSICAL, "light.other");
    match registry.reconfigure(&PairingId::from("p"), &moved).await {
        Err(RegistryError::Configuration(e)) => assert_eq!(e.field, FormField::SmartDevice),
        other => panic!("expected configuration error, got {:?}", other),
    }
}
