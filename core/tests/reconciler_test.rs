use qpanel_core::{
    CallKey, HighlightScope, Reconciler, ReconcilerConfig, MAX_PARAM_SECS, MAX_RECORDS,
    MAX_REPEAT_COUNT,
};
use std::sync::Arc;
use serde_json::json;
use std::time::Duration;

fn snapshot(current: Option<(&str, &str, &str)>, recent: &[(&str, &str, &str)]) -> Vec<u8> {
    let call = |(name, location, at): (&str, &str, &str)| {
        json!({ "nomePaciente": name, "guicheOuSala": location, "dataHoraChamada": at })
    };
    let mut body = json!({
        "ultimasChamadas": recent.iter().copied().map(call).collect::<Vec<_>>(),
        "tempoExibicao": 15,
    });
    if let Some(current) = current {
        body["chamadaAtual"] = call(current);
    }
    serde_json::to_vec(&body).unwrap()
}

fn single(entry_id: &str, name: &str, at: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "entradaFilaId": entry_id,
        "clienteNome": name,
        "senha": "A1",
        "filaId": 1,
        "filaNome": "Triagem",
        "setorNome": "Recepção",
        "guicheOuSalaAtendimento": "Guichê 2",
        "timestamp": at,
    }))
    .unwrap()
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn snapshot_highlight_expires_after_display_window() {
    let reconciler = Reconciler::default();
    let announcement = reconciler.apply_message(
        "1",
        &snapshot(Some(("Ana", "Sala 1", "2024-01-01T10:00:00Z")), &[]),
    );

    let view = reconciler.view("1").expect("queue created");
    assert_eq!(view.len(), 1);
    assert!(view.records[0].is_new);
    assert_eq!(view.records[0].subject_name, "Ana");
    let announcement = announcement.expect("current call is announced");
    assert_eq!(announcement.text, "Ana, Sala 1");
    assert_eq!(announcement.repeat_count, 1);

    sleep_ms(14_900).await;
    assert!(reconciler.view("1").unwrap().records[0].is_new);

    sleep_ms(200).await;
    let view = reconciler.view("1").unwrap();
    assert_eq!(view.len(), 1, "record is retained after the highlight ends");
    assert!(!view.records[0].is_new);
    assert_eq!(reconciler.pending_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_single_call_keeps_one_record_at_head() {
    let reconciler = Reconciler::default();
    reconciler.apply_message("1", &single("X", "Bruno", "2024-01-01T10:00:00"));
    reconciler.apply_message("1", &single("Y", "Carla", "2024-01-01T10:01:00"));
    let announcement = reconciler.apply_message("1", &single("X", "Bruno", "2024-01-01T10:02:00"));

    let view = reconciler.view("1").unwrap();
    assert_eq!(view.len(), 2);
    assert_eq!(view.records[0].key, CallKey::entry("X"));
    assert!(view.records[0].is_new);
    assert_eq!(view.new_count(), 1);
    assert_eq!(view.records[0].ticket.as_deref(), Some("A1"));
    assert_eq!(view.records[0].queue_name.as_deref(), Some("Triagem"));
    assert_eq!(announcement.unwrap().text, "Senha A1, Bruno, Guichê 2");

    // Single calls use a fixed 5s highlight
    sleep_ms(5_001).await;
    assert_eq!(reconciler.view("1").unwrap().new_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn eleven_single_calls_evict_the_first() {
    let reconciler = Reconciler::default();
    for i in 0..11 {
        let at = format!("2024-01-01T10:{:02}:00", i);
        reconciler.apply_message("1", &single(&format!("E{}", i), "Paciente", &at));
    }
    let view = reconciler.view("1").unwrap();
    assert_eq!(view.len(), MAX_RECORDS);
    assert!(view.get(&CallKey::entry("E0")).is_none());
    assert_eq!(view.records[0].key, CallKey::entry("E10"));
}

#[tokio::test(start_paused = true)]
async fn snapshots_stay_sorted_bounded_and_deduplicated() {
    let reconciler = Reconciler::default();
    let history: Vec<(String, String)> = (0..9)
        .map(|i| (format!("P{}", i), format!("2024-01-01T09:{:02}:00Z", 10 + i)))
        .collect();
    let recent: Vec<(&str, &str, &str)> = history
        .iter()
        .map(|(n, t)| (n.as_str(), "Sala 2", t.as_str()))
        .collect();

    reconciler.apply_message("1", &snapshot(None, &recent[..5]));
    reconciler.apply_message("1", &snapshot(None, &recent[3..]));
    reconciler.apply_message(
        "1",
        &snapshot(Some(("Ana", "Sala 1", "2024-01-01T10:00:00Z")), &recent),
    );
    reconciler.apply_message(
        "1",
        &snapshot(Some(("Bia", "Sala 3", "2024-01-01T10:05:00Z")), &recent[..2]),
    );

    let view = reconciler.view("1").unwrap();
    assert_eq!(view.len(), MAX_RECORDS);
    assert!(view.is_sorted_desc());
    assert_eq!(view.records[0].subject_name, "Bia");
    assert_eq!(view.new_count(), 1);
    assert!(view.records[0].is_new);
    // The oldest history entry fell off
    assert!(view.records.iter().all(|r| r.subject_name != "P0"));
}

#[tokio::test(start_paused = true)]
async fn identical_snapshot_is_idempotent_but_renews_the_highlight() {
    let reconciler = Reconciler::default();
    let message = snapshot(
        Some(("Ana", "Sala 1", "2024-01-01T10:00:00Z")),
        &[("Bruno", "Sala 2", "2024-01-01T09:50:00Z")],
    );

    reconciler.apply_message("1", &message);
    let first = reconciler.view("1").unwrap();

    sleep_ms(10_000).await;
    let again = reconciler.apply_message("1", &message);
    assert_eq!(reconciler.view("1").unwrap(), first);
    assert!(again.is_some(), "re-delivered current call is announced again");

    // The first window would have ended at 15s; the renewed one ends at 25s
    sleep_ms(10_000).await;
    assert!(reconciler.view("1").unwrap().records[0].is_new);
    sleep_ms(5_001).await;
    assert_eq!(reconciler.view("1").unwrap().new_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn recent_calls_never_overwrite_existing_flags() {
    let reconciler = Reconciler::default();
    reconciler.apply_message(
        "1",
        &snapshot(Some(("Ana", "Sala 1", "2024-01-01T10:00:00Z")), &[]),
    );
    // History-only snapshot that includes Ana again
    let announcement = reconciler.apply_message(
        "1",
        &snapshot(None, &[("Ana", "Sala 1", "2024-01-01T10:00:00Z")]),
    );
    assert!(announcement.is_none());
    let view = reconciler.view("1").unwrap();
    assert_eq!(view.len(), 1);
    assert!(view.records[0].is_new);
}

#[tokio::test(start_paused = true)]
async fn malformed_messages_are_no_ops() {
    let reconciler = Reconciler::default();
    reconciler.apply_message(
        "1",
        &snapshot(Some(("Ana", "Sala 1", "2024-01-01T10:00:00Z")), &[]),
    );
    let before = reconciler.view("1").unwrap();

    let bad: Vec<Vec<u8>> = vec![
        b"not json".to_vec(),
        b"[1,2,3]".to_vec(),
        br#"{"foo": 1}"#.to_vec(),
        // One bad entry rejects the whole snapshot
        snapshot(
            Some(("Bia", "Sala 1", "2024-01-01T10:05:00Z")),
            &[("", "Sala 2", "2024-01-01T09:00:00Z")],
        ),
        snapshot(Some(("Bia", "Sala 1", "ontem")), &[]),
        single("", "Carla", "2024-01-01T10:00:00"),
        single("Z", "Carla", "not a time"),
    ];
    for message in bad {
        assert!(reconciler.apply_message("1", &message).is_none());
    }
    assert_eq!(reconciler.view("1").unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn silent_snapshot_and_voice_template() {
    let reconciler = Reconciler::new(ReconcilerConfig {
        repeat_interval: Duration::from_secs(7),
        ..ReconcilerConfig::default()
    });
    let quiet = serde_json::to_vec(&json!({
        "chamadaAtual": { "nomePaciente": "Ana", "guicheOuSala": "Sala 1", "dataHoraChamada": "2024-01-01T10:00:00Z" },
        "sinalizacaoSonora": false,
    }))
    .unwrap();
    assert!(reconciler.apply_message("1", &quiet).is_none());
    assert!(reconciler.view("1").unwrap().records[0].is_new);

    let templated = serde_json::to_vec(&json!({
        "chamadaAtual": { "nomePaciente": "Bia", "guicheOuSala": "Sala 4", "dataHoraChamada": "2024-01-01T10:01:00Z" },
        "mensagemVocalizacao": "Atenção {nome}, dirija-se à {local}",
        "repeticoes": 3,
    }))
    .unwrap();
    let announcement = reconciler.apply_message("1", &templated).unwrap();
    assert_eq!(announcement.text, "Atenção Bia, dirija-se à Sala 4");
    assert_eq!(announcement.repeat_count, 3);
    assert_eq!(announcement.repeat_interval_secs, 7);
}

#[tokio::test(start_paused = true)]
async fn extreme_snapshot_parameters_are_capped() {
    let reconciler = Arc::new(Reconciler::default());
    let message = serde_json::to_vec(&json!({
        "chamadaAtual": { "nomePaciente": "Ana", "guicheOuSala": "Sala 1", "dataHoraChamada": "2024-01-01T10:00:00Z" },
        "tempoExibicao": 1e30,
        "intervaloRepeticao": 1e19,
        "repeticoes": 1_000_000_000i64,
    }))
    .unwrap();

    // Runs where the panel runs it: on a consumer task
    let task_reconciler = Arc::clone(&reconciler);
    let announcement = tokio::spawn(async move { task_reconciler.apply_message("1", &message) })
        .await
        .expect("consumer task survives")
        .expect("current call is announced");
    assert_eq!(announcement.repeat_count, MAX_REPEAT_COUNT);
    assert_eq!(announcement.repeat_interval_secs, MAX_PARAM_SECS);

    sleep_ms(MAX_PARAM_SECS * 1_000 - 100).await;
    assert!(reconciler.view("1").unwrap().records[0].is_new);
    sleep_ms(200).await;
    assert!(!reconciler.view("1").unwrap().records[0].is_new);
}

#[tokio::test(start_paused = true)]
async fn single_call_echoed_by_snapshot_is_not_duplicated() {
    let reconciler = Reconciler::default();
    reconciler.apply_message("1", &single("X", "Bruno", "2024-01-01T10:00:00Z"));
    reconciler.apply_message(
        "1",
        &snapshot(
            None,
            &[
                ("Bruno", "Guichê 2", "2024-01-01T10:00:00Z"),
                ("Ana", "Sala 1", "2024-01-01T09:00:00Z"),
            ],
        ),
    );

    let view = reconciler.view("1").unwrap();
    assert_eq!(view.len(), 2);
    assert!(view.is_sorted_desc());
    assert_eq!(view.records[0].key, CallKey::entry("X"));
    assert_eq!(view.records[0].ticket.as_deref(), Some("A1"));
}

#[tokio::test(start_paused = true)]
async fn stale_current_call_is_not_announced() {
    let reconciler = Reconciler::default();
    for i in 0..MAX_RECORDS {
        reconciler.apply_message(
            "1",
            &single(&format!("E{}", i), "Paciente", &format!("2024-01-01T11:{:02}:00", i)),
        );
    }
    let announcement = reconciler.apply_message(
        "1",
        &snapshot(Some(("Antigo", "Sala 1", "2024-01-01T08:00:00Z")), &[]),
    );
    assert!(announcement.is_none());
    let view = reconciler.view("1").unwrap();
    assert!(view.records.iter().all(|r| r.subject_name != "Antigo"));
}

#[tokio::test(start_paused = true)]
async fn queues_are_independent_under_queue_scope() {
    let reconciler = Reconciler::default();
    reconciler.apply_message("1", &single("A", "Ana", "2024-01-01T10:00:00"));
    reconciler.apply_message("2", &single("B", "Bia", "2024-01-01T10:00:01"));
    assert_eq!(reconciler.new_count(), 2);
    assert_eq!(reconciler.queues(), vec!["1".to_string(), "2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn panel_scope_keeps_one_highlight_across_queues() {
    let reconciler = Reconciler::new(ReconcilerConfig {
        highlight_scope: HighlightScope::Panel,
        ..ReconcilerConfig::default()
    });
    reconciler.apply_message(
        "1",
        &snapshot(Some(("Ana", "Sala 1", "2024-01-01T10:00:00Z")), &[]),
    );
    reconciler.apply_message("2", &single("B", "Bia", "2024-01-01T10:00:01"));

    assert_eq!(reconciler.new_count(), 1);
    assert_eq!(reconciler.view("1").unwrap().new_count(), 0);
    assert_eq!(reconciler.view("2").unwrap().new_count(), 1);
    // Queue 1's timer was cancelled along with its flag
    assert_eq!(reconciler.pending_timers(), 1);
}

#[tokio::test(start_paused = true)]
async fn change_notifications_and_teardown() {
    let reconciler = Reconciler::default();
    let mut changes = reconciler.subscribe_changes();

    reconciler.apply_message("1", &single("A", "Ana", "2024-01-01T10:00:00"));
    assert!(changes.has_changed().unwrap());
    changes.borrow_and_update();

    // Highlight expiry is a visible change too
    sleep_ms(5_001).await;
    assert!(changes.has_changed().unwrap());
    changes.borrow_and_update();

    // Malformed input is not
    reconciler.apply_message("1", b"{}");
    assert!(!changes.has_changed().unwrap());

    reconciler.apply_message("2", &single("B", "Bia", "2024-01-01T10:00:00"));
    assert!(reconciler.remove_queue("2"));
    assert!(reconciler.view("2").is_none());
    assert!(!reconciler.remove_queue("2"));

    reconciler.apply_message("1", &single("C", "Caio", "2024-01-01T10:01:00"));
    assert_eq!(reconciler.pending_timers(), 1);
    reconciler.clear();
    assert_eq!(reconciler.pending_timers(), 0);
    assert!(reconciler.queues().is_empty());
}
