use super::conflict::{self, validate_dates};
use super::*;
use chrono::NaiveDate;
use std::path::PathBuf;

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn guest(id_number: &str) -> GuestDetails {
    GuestDetails {
        name: "Jamie".into(),
        surname: "Rivera".into(),
        id_number: id_number.into(),
        contact: Some("+1 555 0100".into()),
    }
}

/// A bare pass record for the pure conflict tests.
fn pass(requester: Ulid, start: &str, end: &str, status: PassStatus) -> GuestPass {
    GuestPass {
        id: Ulid::new(),
        requester_id: requester,
        room_id: None,
        guest: guest("G-1"),
        dates: DateRange::new(d(start), d(end)).unwrap(),
        status,
        resolved_by: None,
        resolved_at: None,
        comments: None,
        created_at: 0,
        updated_at: 0,
    }
}

// ── Conflict checker ─────────────────────────────────────

#[test]
fn conflict_on_shared_boundary_day() {
    let r = Ulid::new();
    let existing = vec![pass(r, "2025-01-10", "2025-01-15", PassStatus::Approved)];
    let candidate = pass(r, "2025-01-15", "2025-01-20", PassStatus::Pending);
    assert!(has_conflict(&candidate, &existing, None));
}

#[test]
fn no_conflict_starting_day_after() {
    let r = Ulid::new();
    let existing = vec![pass(r, "2025-01-10", "2025-01-15", PassStatus::Approved)];
    let candidate = pass(r, "2025-01-16", "2025-01-20", PassStatus::Pending);
    assert!(!has_conflict(&candidate, &existing, None));
}

#[test]
fn rejected_pass_never_blocks() {
    let r = Ulid::new();
    let existing = vec![pass(r, "2025-01-10", "2025-01-15", PassStatus::Rejected)];
    let candidate = pass(r, "2025-01-12", "2025-01-13", PassStatus::Pending);
    assert!(!has_conflict(&candidate, &existing, None));
}

#[test]
fn other_requester_never_blocks() {
    let existing = vec![pass(Ulid::new(), "2025-01-10", "2025-01-15", PassStatus::Approved)];
    let candidate = pass(Ulid::new(), "2025-01-10", "2025-01-15", PassStatus::Pending);
    assert!(!has_conflict(&candidate, &existing, None));
}

#[test]
fn pending_and_approved_peers_both_block() {
    let r = Ulid::new();
    for status in [PassStatus::Pending, PassStatus::Approved] {
        let existing = vec![pass(r, "2025-03-01", "2025-03-03", status)];
        let candidate = pass(r, "2025-03-02", "2025-03-02", PassStatus::Approved);
        assert!(has_conflict(&candidate, &existing, None), "{status:?} should block");
    }
}

#[test]
fn edited_pass_does_not_conflict_with_itself() {
    let r = Ulid::new();
    let original = pass(r, "2025-01-10", "2025-01-15", PassStatus::Pending);
    let mut edited = original.clone();
    edited.dates = DateRange::new(d("2025-01-11"), d("2025-01-16")).unwrap();
    let existing = vec![original.clone()];
    assert!(!has_conflict(&edited, &existing, Some(original.id)));
    assert!(has_conflict(&edited, &existing, None));
}

#[test]
fn find_conflict_names_the_blocking_pass() {
    let r = Ulid::new();
    let a = pass(r, "2025-05-01", "2025-05-02", PassStatus::Rejected);
    let b = pass(r, "2025-05-01", "2025-05-04", PassStatus::Pending);
    let existing = vec![a, b.clone()];
    let candidate = pass(r, "2025-05-03", "2025-05-05", PassStatus::Pending);
    assert_eq!(find_conflict(&candidate, &existing, None).map(|p| p.id), Some(b.id));
}

#[test]
fn date_validation() {
    assert!(matches!(
        validate_dates(d("2025-01-10"), d("2025-01-09")),
        Err(EngineError::InvalidDateRange)
    ));
    assert!(matches!(
        validate_dates(d("2025-01-01"), d("2025-02-15")),
        Err(EngineError::LimitExceeded(_))
    ));
    let one_day = validate_dates(d("2025-01-10"), d("2025-01-10")).unwrap();
    assert_eq!(one_day.days(), 1);
    assert!(validate_dates(d("2025-01-01"), d("2025-01-31")).is_ok());
}

// ── Async engine tests ───────────────────────────────────

fn test_paths(name: &str) -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join("hallkeep_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let wal = dir.join(format!("{name}.wal"));
    let files = dir.join(format!("{name}.files"));
    let _ = std::fs::remove_file(&wal);
    let _ = std::fs::remove_dir_all(&files);
    (wal, files)
}

fn new_engine(name: &str) -> Engine {
    let (wal, files) = test_paths(name);
    Engine::new(wal, files).unwrap()
}

fn admin() -> Actor {
    Actor::superuser()
}

async fn account(engine: &Engine, email: &str, role: Role) -> (Actor, Ulid) {
    let created = engine
        .create_account(
            &admin(),
            NewAccount {
                id: Ulid::new(),
                email: email.into(),
                first_name: "Test".into(),
                last_name: "User".into(),
                role,
                student_number: None,
                phone: None,
            },
        )
        .await
        .unwrap();
    (Actor::of(&created), created.id)
}

async fn student(engine: &Engine, email: &str) -> (Actor, Ulid) {
    account(engine, email, Role::Student).await
}

async fn room(engine: &Engine, number: &str, capacity: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .create_room(
            &admin(),
            NewRoom {
                id,
                number: number.into(),
                capacity: Some(capacity),
                room_type: None,
                building: Some("North".into()),
                floor: Some(1),
            },
        )
        .await
        .unwrap();
    id
}

async fn occupancy_of(engine: &Engine, id: Ulid) -> u32 {
    engine.get_room(&id).unwrap().read().await.occupancy()
}

fn request(id_number: &str, start: &str, end: &str) -> PassRequest {
    PassRequest {
        id: Ulid::new(),
        requester_id: None,
        room_id: None,
        guest: guest(id_number),
        start: d(start),
        end: d(end),
    }
}

#[tokio::test]
async fn room_capacity_defaults_by_type() {
    let engine = new_engine("room_defaults");
    let quad = engine
        .create_room(
            &admin(),
            NewRoom {
                id: Ulid::new(),
                number: "Q1".into(),
                capacity: None,
                room_type: Some("quad".into()),
                building: None,
                floor: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(quad.capacity, 4);
    assert_eq!(quad.occupancy, Some(0));

    let zero = engine
        .create_room(
            &admin(),
            NewRoom {
                id: Ulid::new(),
                number: "Z1".into(),
                capacity: Some(0),
                room_type: None,
                building: None,
                floor: None,
            },
        )
        .await;
    assert!(matches!(zero, Err(EngineError::InvalidState(_))));
}

#[tokio::test]
async fn room_numbers_are_unique() {
    let engine = new_engine("room_unique");
    let a = room(&engine, "A101", 2).await;
    let b = room(&engine, "A102", 2).await;
    let dup = engine
        .create_room(
            &admin(),
            NewRoom {
                id: Ulid::new(),
                number: "A101".into(),
                capacity: Some(1),
                room_type: None,
                building: None,
                floor: None,
            },
        )
        .await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(_))));

    let renumber = RoomChanges {
        number: Some("A101".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_room(&admin(), b, renumber).await,
        Err(EngineError::AlreadyExists(_))
    ));

    // Renaming frees the old number.
    let renumber = RoomChanges {
        number: Some("A201".into()),
        ..Default::default()
    };
    engine.update_room(&admin(), a, renumber).await.unwrap();
    room(&engine, "A101", 1).await;
}

#[tokio::test]
async fn students_cannot_manage_rooms() {
    let engine = new_engine("room_forbidden");
    let (alice, _) = student(&engine, "alice@hall.test").await;
    let result = engine
        .create_room(
            &alice,
            NewRoom {
                id: Ulid::new(),
                number: "X1".into(),
                capacity: Some(1),
                room_type: None,
                building: None,
                floor: None,
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
}

#[tokio::test]
async fn assign_until_full() {
    let engine = new_engine("assign_full");
    let r = room(&engine, "B1", 2).await;
    let (_, s1) = student(&engine, "s1@hall.test").await;
    let (_, s2) = student(&engine, "s2@hall.test").await;
    let (_, s3) = student(&engine, "s3@hall.test").await;

    engine.assign_resident(&admin(), s1, r).await.unwrap();
    engine.assign_resident(&admin(), s2, r).await.unwrap();
    let err = engine.assign_resident(&admin(), s3, r).await.unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded(2)));

    assert_eq!(occupancy_of(&engine, r).await, 2);
    assert_eq!(engine.get_account(&s3).unwrap().room_id, None);
    assert_eq!(engine.get_account(&s1).unwrap().room_id, Some(r));
}

#[tokio::test]
async fn assign_moves_student_between_rooms() {
    let engine = new_engine("assign_move");
    let r1 = room(&engine, "C1", 2).await;
    let r2 = room(&engine, "C2", 2).await;
    let (_, s) = student(&engine, "mover@hall.test").await;

    engine.assign_resident(&admin(), s, r1).await.unwrap();
    engine.assign_resident(&admin(), s, r2).await.unwrap();
    assert_eq!(occupancy_of(&engine, r1).await, 0);
    assert_eq!(occupancy_of(&engine, r2).await, 1);
    assert_eq!(engine.get_account(&s).unwrap().room_id, Some(r2));

    // Same room again is a no-op.
    engine.assign_resident(&admin(), s, r2).await.unwrap();
    assert_eq!(occupancy_of(&engine, r2).await, 1);
}

#[tokio::test]
async fn only_active_students_get_rooms() {
    let engine = new_engine("assign_roles");
    let r = room(&engine, "D1", 2).await;
    let (_, staff) = account(&engine, "warden@hall.test", Role::Admin).await;
    assert!(matches!(
        engine.assign_resident(&admin(), staff, r).await,
        Err(EngineError::InvalidState(_))
    ));

    let (_, s) = student(&engine, "off@hall.test").await;
    engine
        .set_account_status(&admin(), s, AccountStatus::Disabled, Some("left".into()))
        .await
        .unwrap();
    assert!(matches!(
        engine.assign_resident(&admin(), s, r).await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(matches!(
        engine.assign_resident(&admin(), Ulid::new(), r).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn remove_resident_checks_room() {
    let engine = new_engine("remove_resident");
    let r1 = room(&engine, "E1", 2).await;
    let r2 = room(&engine, "E2", 2).await;
    let (_, s) = student(&engine, "e@hall.test").await;

    assert!(matches!(
        engine.remove_resident(&admin(), s, None).await,
        Err(EngineError::InvalidState(_))
    ));
    engine.assign_resident(&admin(), s, r1).await.unwrap();
    assert!(matches!(
        engine.remove_resident(&admin(), s, Some(r2)).await,
        Err(EngineError::InvalidState(_))
    ));
    engine.remove_resident(&admin(), s, Some(r1)).await.unwrap();
    assert_eq!(occupancy_of(&engine, r1).await, 0);
    assert_eq!(engine.get_account(&s).unwrap().room_id, None);
}

#[tokio::test]
async fn reset_clears_every_resident() {
    let engine = new_engine("reset_room");
    let r = room(&engine, "F1", 3).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let (_, s) = student(&engine, &format!("f{i}@hall.test")).await;
        engine.assign_resident(&admin(), s, r).await.unwrap();
        ids.push(s);
    }
    let mut removed = engine.reset_room(&admin(), r).await.unwrap();
    removed.sort();
    ids.sort();
    assert_eq!(removed, ids);
    assert_eq!(occupancy_of(&engine, r).await, 0);
    for id in ids {
        assert_eq!(engine.get_account(&id).unwrap().room_id, None);
    }
}

#[tokio::test]
async fn occupied_rooms_and_residents_cannot_be_deleted() {
    let engine = new_engine("delete_guards");
    let r = room(&engine, "G1", 2).await;
    let (_, s) = student(&engine, "g@hall.test").await;
    engine.assign_resident(&admin(), s, r).await.unwrap();

    assert!(matches!(
        engine.delete_room(&admin(), r).await,
        Err(EngineError::RoomOccupied(id)) if id == r
    ));
    assert!(matches!(
        engine.delete_account(&admin(), s).await,
        Err(EngineError::InvalidState(_))
    ));
    let shrink = RoomChanges {
        capacity: Some(1),
        ..Default::default()
    };
    engine.update_room(&admin(), r, shrink).await.unwrap();
    let (_, t) = student(&engine, "g2@hall.test").await;
    assert!(matches!(
        engine.assign_resident(&admin(), t, r).await,
        Err(EngineError::CapacityExceeded(1))
    ));

    engine.remove_resident(&admin(), s, None).await.unwrap();
    engine.delete_account(&admin(), s).await.unwrap();
    engine.delete_room(&admin(), r).await.unwrap();
    assert!(engine.get_room(&r).is_none());
    assert!(engine.account_by_email("g@hall.test").is_none());
}

#[tokio::test]
async fn capacity_cannot_drop_below_occupancy() {
    let engine = new_engine("capacity_shrink");
    let r = room(&engine, "H1", 2).await;
    for i in 0..2 {
        let (_, s) = student(&engine, &format!("h{i}@hall.test")).await;
        engine.assign_resident(&admin(), s, r).await.unwrap();
    }
    let shrink = RoomChanges {
        capacity: Some(1),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_room(&admin(), r, shrink).await,
        Err(EngineError::InvalidState(_))
    ));
    assert_eq!(engine.get_room(&r).unwrap().read().await.capacity, 2);
}

#[tokio::test]
async fn resolve_actor_by_login() {
    let engine = new_engine("resolve_actor");
    let (_, s) = student(&engine, "Mixed.Case@Hall.test").await;

    assert_eq!(engine.resolve_actor("admin", "admin"), Actor::superuser());
    let actor = engine.resolve_actor("mixed.case@hall.test", "admin");
    assert_eq!(actor.id, Some(s));
    assert_eq!(actor.role, Some(Role::Student));
    assert_eq!(engine.resolve_actor("nobody@hall.test", "admin"), Actor::anonymous());

    engine
        .set_account_status(&admin(), s, AccountStatus::Disabled, None)
        .await
        .unwrap();
    assert_eq!(engine.resolve_actor("mixed.case@hall.test", "admin"), Actor::anonymous());
}

#[tokio::test]
async fn duplicate_email_is_rejected() {
    let engine = new_engine("dup_email");
    student(&engine, "same@hall.test").await;
    let dup = engine
        .create_account(
            &admin(),
            NewAccount {
                id: Ulid::new(),
                email: "SAME@hall.test".into(),
                first_name: "Other".into(),
                last_name: "Person".into(),
                role: Role::Student,
                student_number: None,
                phone: None,
            },
        )
        .await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(_))));
}

fn signup(email: &str, student_number: &str) -> NewAccount {
    NewAccount {
        id: Ulid::new(),
        email: email.into(),
        first_name: "Sam".into(),
        last_name: "Okafor".into(),
        role: Role::Student,
        student_number: Some(student_number.into()),
        phone: Some("555-0110".into()),
    }
}

#[tokio::test]
async fn sign_up_waits_for_approval() {
    let engine = new_engine("sign_up");
    let created = engine
        .sign_up("sam@hall.test", signup("Sam@Hall.test", "S-100"))
        .await
        .unwrap();
    assert_eq!(created.status, AccountStatus::Pending);
    assert_eq!(created.status_changed_by, None);

    // Pending accounts act as anonymous until an admin approves them.
    let actor = engine.resolve_actor("sam@hall.test", "admin");
    assert_eq!(actor, Actor::anonymous());
    engine
        .set_account_status(&admin(), created.id, AccountStatus::Active, None)
        .await
        .unwrap();
    assert_eq!(engine.resolve_actor("sam@hall.test", "admin").id, Some(created.id));
}

#[tokio::test]
async fn sign_up_rules() {
    let engine = new_engine("sign_up_rules");

    let other_login = engine.sign_up("eve@hall.test", signup("sam@hall.test", "S-1")).await;
    assert!(matches!(other_login, Err(EngineError::Forbidden(_))));

    let mut as_admin = signup("sam@hall.test", "S-1");
    as_admin.role = Role::Admin;
    let as_admin = engine.sign_up("sam@hall.test", as_admin).await;
    assert!(matches!(as_admin, Err(EngineError::Forbidden(_))));

    let mut no_phone = signup("sam@hall.test", "S-1");
    no_phone.phone = Some("  ".into());
    let no_phone = engine.sign_up("sam@hall.test", no_phone).await;
    assert!(matches!(no_phone, Err(EngineError::InvalidState(_))));

    engine.sign_up("sam@hall.test", signup("sam@hall.test", "S-1")).await.unwrap();
    let again = engine.sign_up("sam@hall.test", signup("sam@hall.test", "S-2")).await;
    assert!(matches!(again, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn student_numbers_are_unique() {
    let engine = new_engine("student_numbers");
    let first = engine
        .create_account(&admin(), signup("a@hall.test", "S-7"))
        .await
        .unwrap();
    let dup = engine.create_account(&admin(), signup("b@hall.test", "S-7")).await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(n)) if n == "S-7"));
    let dup = engine.sign_up("c@hall.test", signup("c@hall.test", "S-7")).await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(_))));

    let second = engine
        .create_account(&admin(), signup("b@hall.test", "S-8"))
        .await
        .unwrap();
    let steal = AccountChanges {
        student_number: Some("S-7".into()),
        ..Default::default()
    };
    let steal = engine.update_account(&admin(), second.id, steal).await;
    assert!(matches!(steal, Err(EngineError::AlreadyExists(_))));

    // Keeping one's own number is fine; a freed number can be reused.
    let same = AccountChanges {
        student_number: Some("S-7".into()),
        ..Default::default()
    };
    engine.update_account(&admin(), first.id, same).await.unwrap();
    engine.delete_account(&admin(), first.id).await.unwrap();
    let reuse = AccountChanges {
        student_number: Some("S-7".into()),
        ..Default::default()
    };
    engine.update_account(&admin(), second.id, reuse).await.unwrap();
    let dup = engine.create_account(&admin(), signup("d@hall.test", "S-8")).await;
    assert!(dup.is_ok(), "S-8 was released by the renumbering");
}

#[tokio::test]
async fn profiles_are_edited_by_owner_or_admin() {
    let engine = new_engine("profile_edit");
    let (alice, alice_id) = student(&engine, "alice@hall.test").await;
    let (bob, _) = student(&engine, "bob@hall.test").await;

    let phone = AccountChanges {
        phone: Some("555-0123".into()),
        ..Default::default()
    };
    let updated = engine.update_account(&alice, alice_id, phone).await.unwrap();
    assert_eq!(updated.phone.as_deref(), Some("555-0123"));
    assert_eq!(updated.first_name, "Test");

    let rename = AccountChanges {
        first_name: Some("Mallory".into()),
        ..Default::default()
    };
    let by_bob = engine.update_account(&bob, alice_id, rename.clone()).await;
    assert!(matches!(by_bob, Err(EngineError::Forbidden(_))));
    let updated = engine.update_account(&admin(), alice_id, rename).await.unwrap();
    assert_eq!(updated.first_name, "Mallory");
    assert_eq!(updated.phone.as_deref(), Some("555-0123"));

    let nothing = engine
        .update_account(&alice, alice_id, AccountChanges::default())
        .await;
    assert!(matches!(nothing, Err(EngineError::InvalidState(_))));
}

#[tokio::test]
async fn profile_edits_survive_replay_and_compaction() {
    let (wal, files) = test_paths("profile_replay");
    let id;
    {
        let engine = Engine::new(wal.clone(), files.clone()).unwrap();
        id = engine
            .create_account(&admin(), signup("ren@hall.test", "S-1"))
            .await
            .unwrap()
            .id;
        let changes = AccountChanges {
            last_name: Some("Ito".into()),
            student_number: Some("S-2".into()),
            ..Default::default()
        };
        engine.update_account(&admin(), id, changes).await.unwrap();
    }
    {
        let engine = Engine::new(wal.clone(), files.clone()).unwrap();
        let account = engine.get_account(&id).unwrap();
        assert_eq!(account.last_name, "Ito");
        assert_eq!(account.student_number.as_deref(), Some("S-2"));
        engine.compact_wal().await.unwrap();
    }

    let engine = Engine::new(wal, files).unwrap();
    assert_eq!(engine.get_account(&id).unwrap().last_name, "Ito");
    let dup = engine.create_account(&admin(), signup("kai@hall.test", "S-2")).await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(_))));
    engine
        .create_account(&admin(), signup("kai@hall.test", "S-1"))
        .await
        .unwrap();
}

// ── Passes ───────────────────────────────────────────────

#[tokio::test]
async fn pass_conflicts_are_requester_scoped() {
    let engine = new_engine("pass_conflict");
    let (alice, _) = student(&engine, "alice@hall.test").await;
    let (bob, _) = student(&engine, "bob@hall.test").await;

    let first = engine
        .request_pass(&alice, request("G-1", "2025-01-10", "2025-01-15"))
        .await
        .unwrap();
    assert_eq!(first.status, PassStatus::Pending);

    let err = engine
        .request_pass(&alice, request("G-2", "2025-01-15", "2025-01-20"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == first.id));

    engine
        .request_pass(&alice, request("G-2", "2025-01-16", "2025-01-20"))
        .await
        .unwrap();
    engine
        .request_pass(&bob, request("G-1", "2025-01-10", "2025-01-15"))
        .await
        .unwrap();
}

#[tokio::test]
async fn rejected_pass_frees_its_dates() {
    let engine = new_engine("pass_rejected");
    let (alice, _) = student(&engine, "alice@hall.test").await;
    let first = engine
        .request_pass(&alice, request("G-1", "2025-02-01", "2025-02-03"))
        .await
        .unwrap();
    engine
        .resolve_pass(&admin(), first.id, PassStatus::Rejected, Some("quiet week".into()))
        .await
        .unwrap();
    engine
        .request_pass(&alice, request("G-1", "2025-02-02", "2025-02-04"))
        .await
        .unwrap();
}

#[tokio::test]
async fn pass_is_resolved_at_most_once() {
    let engine = new_engine("pass_resolve_once");
    let (alice, _) = student(&engine, "alice@hall.test").await;
    let p = engine
        .request_pass(&alice, request("G-1", "2025-03-01", "2025-03-02"))
        .await
        .unwrap();

    let approved = engine
        .resolve_pass(&admin(), p.id, PassStatus::Approved, None)
        .await
        .unwrap();
    assert_eq!(approved.status, PassStatus::Approved);
    let stamped_at = approved.resolved_at;
    assert!(stamped_at.is_some());

    for status in [PassStatus::Approved, PassStatus::Rejected] {
        let err = engine
            .resolve_pass(&admin(), p.id, status, Some("again".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(id) if id == p.id));
    }
    let passes = engine
        .list_passes(&admin(), &PassFilter { id: Some(p.id), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(passes[0].status, PassStatus::Approved);
    assert_eq!(passes[0].resolved_at, stamped_at);
    assert_eq!(passes[0].comments, None);

    assert!(matches!(
        engine.resolve_pass(&alice, p.id, PassStatus::Rejected, None).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn edit_pending_pass_only_by_requester() {
    let engine = new_engine("pass_edit");
    let (alice, _) = student(&engine, "alice@hall.test").await;
    let (bob, _) = student(&engine, "bob@hall.test").await;
    let p = engine
        .request_pass(&alice, request("G-1", "2025-04-10", "2025-04-12"))
        .await
        .unwrap();
    let other = engine
        .request_pass(&alice, request("G-9", "2025-04-20", "2025-04-21"))
        .await
        .unwrap();

    // Shifting onto its own old dates is fine; onto the other pass is not.
    let shift = PassChanges {
        start: Some(d("2025-04-11")),
        end: Some(d("2025-04-13")),
        ..Default::default()
    };
    let edited = engine.edit_pass(&alice, p.id, shift.clone()).await.unwrap();
    assert_eq!(edited.dates.start, d("2025-04-11"));

    let clash = PassChanges {
        end: Some(d("2025-04-20")),
        ..Default::default()
    };
    assert!(matches!(
        engine.edit_pass(&alice, p.id, clash).await,
        Err(EngineError::Conflict(id)) if id == other.id
    ));
    assert!(matches!(
        engine.edit_pass(&bob, p.id, shift.clone()).await,
        Err(EngineError::Forbidden(_))
    ));

    engine
        .resolve_pass(&admin(), p.id, PassStatus::Approved, None)
        .await
        .unwrap();
    assert!(matches!(
        engine.edit_pass(&alice, p.id, shift).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn pass_validation_order() {
    let engine = new_engine("pass_validation");
    let (alice, _) = student(&engine, "alice@hall.test").await;
    engine
        .add_to_blacklist(&admin(), "BAD-1".into(), Some("damage".into()))
        .await
        .unwrap();

    // Inverted dates are reported before the blacklist.
    assert!(matches!(
        engine
            .request_pass(&alice, request("BAD-1", "2025-05-10", "2025-05-09"))
            .await,
        Err(EngineError::InvalidDateRange)
    ));
    assert!(matches!(
        engine
            .request_pass(&alice, request("BAD-1", "2025-05-10", "2025-05-11"))
            .await,
        Err(EngineError::GuestBlacklisted)
    ));

    engine.remove_from_blacklist(&admin(), "BAD-1".into()).await.unwrap();
    engine
        .request_pass(&alice, request("BAD-1", "2025-05-10", "2025-05-11"))
        .await
        .unwrap();
}

#[tokio::test]
async fn admin_may_request_on_behalf_of_students() {
    let engine = new_engine("pass_on_behalf");
    let (alice, alice_id) = student(&engine, "alice@hall.test").await;
    let (_, bob_id) = student(&engine, "bob@hall.test").await;

    let mut req = request("G-1", "2025-06-01", "2025-06-02");
    req.requester_id = Some(alice_id);
    let p = engine.request_pass(&admin(), req).await.unwrap();
    assert_eq!(p.requester_id, alice_id);

    let mut req = request("G-2", "2025-06-05", "2025-06-06");
    req.requester_id = Some(bob_id);
    assert!(matches!(
        engine.request_pass(&alice, req).await,
        Err(EngineError::Forbidden(_))
    ));

    // The superuser has no account of its own to file under.
    assert!(matches!(
        engine
            .request_pass(&admin(), request("G-3", "2025-06-05", "2025-06-06"))
            .await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn students_list_and_delete_only_their_own_passes() {
    let engine = new_engine("pass_visibility");
    let (alice, alice_id) = student(&engine, "alice@hall.test").await;
    let (bob, bob_id) = student(&engine, "bob@hall.test").await;
    let pa = engine
        .request_pass(&alice, request("G-1", "2025-07-01", "2025-07-02"))
        .await
        .unwrap();
    engine
        .request_pass(&bob, request("G-2", "2025-07-01", "2025-07-02"))
        .await
        .unwrap();

    let mine = engine.list_passes(&alice, &PassFilter::default()).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].requester_id, alice_id);
    let snoop = PassFilter {
        requester_id: Some(bob_id),
        ..Default::default()
    };
    assert!(engine.list_passes(&alice, &snoop).await.unwrap().is_empty());
    assert_eq!(engine.list_passes(&admin(), &PassFilter::default()).await.unwrap().len(), 2);

    assert!(matches!(
        engine.delete_pass(&bob, pa.id).await,
        Err(EngineError::Forbidden(_))
    ));
    engine.delete_pass(&alice, pa.id).await.unwrap();
    assert!(matches!(
        engine.delete_pass(&alice, pa.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn anonymous_callers_are_refused() {
    let engine = new_engine("anonymous");
    let anon = Actor::anonymous();
    assert!(matches!(
        engine.request_pass(&anon, request("G-1", "2025-01-01", "2025-01-02")).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.list_rooms(&anon, &RoomFilter::default()).await,
        Err(EngineError::Forbidden(_))
    ));
}

// ── Maintenance ──────────────────────────────────────────

#[tokio::test]
async fn ticket_lifecycle_stamps_room() {
    let engine = new_engine("ticket_lifecycle");
    let r = room(&engine, "M1", 2).await;
    let (alice, alice_id) = student(&engine, "alice@hall.test").await;
    let (_, warden) = account(&engine, "warden@hall.test", Role::Admin).await;

    let ticket = engine
        .open_ticket(
            &alice,
            NewTicket {
                id: Ulid::new(),
                room_id: r,
                issue_type: "plumbing".into(),
                priority: Priority::High,
                description: Some("sink drips".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(ticket.student_id, Some(alice_id));
    assert_eq!(ticket.status, TicketStatus::Pending);

    assert!(matches!(
        engine.assign_ticket(&admin(), ticket.id, alice_id).await,
        Err(EngineError::InvalidState(_))
    ));
    engine.assign_ticket(&admin(), ticket.id, warden).await.unwrap();
    let listed = engine.list_tickets(&alice, &TicketFilter::default()).unwrap();
    assert_eq!(listed[0].status, TicketStatus::InProgress);
    assert_eq!(listed[0].assigned_to, Some(warden));

    let cutoff = NaiveDate::from_ymd_opt(9999, 1, 1).unwrap();
    let needing = RoomFilter {
        maintained_before: Some(conflict::today()),
        ..Default::default()
    };
    assert_eq!(engine.list_rooms(&admin(), &needing).await.unwrap().len(), 1);

    let resolved = engine
        .resolve_ticket(&admin(), ticket.id, Some("washer replaced".into()))
        .await
        .unwrap();
    assert_eq!(resolved.status, TicketStatus::Resolved);
    assert!(resolved.resolved_at.is_some());
    assert_eq!(
        engine.get_room(&r).unwrap().read().await.last_maintenance,
        Some(conflict::today())
    );
    assert!(engine.list_rooms(&admin(), &needing).await.unwrap().is_empty());
    let far = RoomFilter {
        maintained_before: Some(cutoff),
        ..Default::default()
    };
    assert_eq!(engine.list_rooms(&admin(), &far).await.unwrap().len(), 1);

    assert!(matches!(
        engine.resolve_ticket(&admin(), ticket.id, None).await,
        Err(EngineError::AlreadyResolved(_))
    ));
    assert!(matches!(
        engine.assign_ticket(&admin(), ticket.id, warden).await,
        Err(EngineError::AlreadyResolved(_))
    ));
}

#[tokio::test]
async fn students_see_only_their_tickets() {
    let engine = new_engine("ticket_visibility");
    let r = room(&engine, "M2", 2).await;
    let (alice, _) = student(&engine, "alice@hall.test").await;
    let (bob, _) = student(&engine, "bob@hall.test").await;
    for actor in [&alice, &bob] {
        engine
            .open_ticket(
                actor,
                NewTicket {
                    id: Ulid::new(),
                    room_id: r,
                    issue_type: "heating".into(),
                    priority: Priority::Low,
                    description: None,
                },
            )
            .await
            .unwrap();
    }
    assert_eq!(engine.list_tickets(&alice, &TicketFilter::default()).unwrap().len(), 1);
    assert_eq!(engine.list_tickets(&admin(), &TicketFilter::default()).unwrap().len(), 2);
    let by_room = TicketFilter {
        room_id: Some(Ulid::new()),
        ..Default::default()
    };
    assert!(engine.list_tickets(&admin(), &by_room).unwrap().is_empty());
}

// ── Attachments ──────────────────────────────────────────

#[tokio::test]
async fn attachment_roundtrip_and_ownership() {
    let engine = new_engine("attachments");
    let (alice, _) = student(&engine, "alice@hall.test").await;
    let (bob, _) = student(&engine, "bob@hall.test").await;
    let owner = Ulid::new();

    let stored = engine
        .store_attachment(
            &alice,
            NewAttachment {
                id: Ulid::new(),
                owner_id: owner,
                file_name: "leak.jpg".into(),
                content_type: Some("image/jpeg".into()),
                data: vec![0xFF, 0xD8, 0xFF, 0xE0],
            },
        )
        .await
        .unwrap();
    assert_eq!(stored.size, 4);

    let (meta, data) = engine.read_attachment(&bob, stored.id).await.unwrap();
    assert_eq!(meta.file_name, "leak.jpg");
    assert_eq!(data, vec![0xFF, 0xD8, 0xFF, 0xE0]);
    assert_eq!(engine.list_attachments(&bob, Some(owner)).unwrap().len(), 1);

    assert!(matches!(
        engine.delete_attachment(&bob, stored.id).await,
        Err(EngineError::Forbidden(_))
    ));
    engine.delete_attachment(&alice, stored.id).await.unwrap();
    assert!(matches!(
        engine.read_attachment(&alice, stored.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn oversized_attachment_is_refused() {
    let engine = new_engine("attachment_limit");
    let result = engine
        .store_attachment(
            &admin(),
            NewAttachment {
                id: Ulid::new(),
                owner_id: Ulid::new(),
                file_name: "huge.bin".into(),
                content_type: None,
                data: vec![0; crate::limits::MAX_ATTACHMENT_BYTES + 1],
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

// ── Reports ──────────────────────────────────────────────

#[tokio::test]
async fn reports_count_everything() {
    let engine = new_engine("reports");
    let r1 = room(&engine, "R1", 1).await;
    room(&engine, "R2", 3).await;
    let (alice, alice_id) = student(&engine, "alice@hall.test").await;
    engine.assign_resident(&admin(), alice_id, r1).await.unwrap();
    let p = engine
        .request_pass(&alice, request("G-1", "2025-08-01", "2025-08-02"))
        .await
        .unwrap();
    engine
        .request_pass(&alice, request("G-2", "2025-08-10", "2025-08-11"))
        .await
        .unwrap();
    engine
        .resolve_pass(&admin(), p.id, PassStatus::Approved, None)
        .await
        .unwrap();

    let occupancy = engine.occupancy_report(&admin()).await.unwrap();
    assert_eq!(
        occupancy,
        OccupancyReport {
            rooms: 2,
            total_capacity: 4,
            total_occupancy: 1,
            full_rooms: 1,
            available_rooms: 1,
        }
    );
    let passes = engine.pass_report(&admin()).await.unwrap();
    assert_eq!((passes.total, passes.pending, passes.approved), (2, 1, 1));
    let accounts = engine.account_report(&admin()).unwrap();
    assert_eq!((accounts.total, accounts.students, accounts.active), (1, 1, 1));

    let report = engine.hall_report(&admin()).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["occupancy"]["full_rooms"], 1);
    assert_eq!(json["passes"]["approved"], 1);

    assert!(matches!(
        engine.occupancy_report(&alice).await,
        Err(EngineError::Forbidden(_))
    ));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_hall() {
    let (wal, files) = test_paths("replay");
    let r1 = Ulid::new();
    let r2 = Ulid::new();
    let (alice_id, pass_id, ticket_id);
    {
        let engine = Engine::new(wal.clone(), files.clone()).unwrap();
        for (id, number) in [(r1, "P1"), (r2, "P2")] {
            engine
                .create_room(
                    &admin(),
                    NewRoom {
                        id,
                        number: number.into(),
                        capacity: Some(2),
                        room_type: None,
                        building: None,
                        floor: None,
                    },
                )
                .await
                .unwrap();
        }
        let (alice, id) = student(&engine, "alice@hall.test").await;
        alice_id = id;
        engine.assign_resident(&admin(), alice_id, r1).await.unwrap();
        engine.assign_resident(&admin(), alice_id, r2).await.unwrap();
        pass_id = engine
            .request_pass(&alice, request("G-1", "2025-09-01", "2025-09-03"))
            .await
            .unwrap()
            .id;
        engine
            .resolve_pass(&admin(), pass_id, PassStatus::Rejected, Some("no".into()))
            .await
            .unwrap();
        ticket_id = Ulid::new();
        engine
            .open_ticket(
                &alice,
                NewTicket {
                    id: ticket_id,
                    room_id: r2,
                    issue_type: "window".into(),
                    priority: Priority::Medium,
                    description: None,
                },
            )
            .await
            .unwrap();
        engine.resolve_ticket(&admin(), ticket_id, None).await.unwrap();
    }

    let engine = Engine::new(wal, files).unwrap();
    assert_eq!(occupancy_of(&engine, r1).await, 0);
    assert_eq!(occupancy_of(&engine, r2).await, 1);
    assert_eq!(engine.get_account(&alice_id).unwrap().room_id, Some(r2));
    assert_eq!(
        engine.get_room(&r2).unwrap().read().await.last_maintenance,
        Some(conflict::today())
    );
    let passes = engine.list_passes(&admin(), &PassFilter::default()).await.unwrap();
    assert_eq!(passes.len(), 1);
    assert_eq!(passes[0].status, PassStatus::Rejected);
    let tickets = engine.list_tickets(&admin(), &TicketFilter::default()).unwrap();
    assert_eq!(tickets[0].status, TicketStatus::Resolved);
}

#[tokio::test]
async fn compact_survives_restart() {
    let (wal, files) = test_paths("compact");
    let r = Ulid::new();
    let (alice_id, keep_pass);
    {
        let engine = Engine::new(wal.clone(), files.clone()).unwrap();
        engine
            .create_room(
                &admin(),
                NewRoom {
                    id: r,
                    number: "K1".into(),
                    capacity: Some(2),
                    room_type: Some("double".into()),
                    building: Some("East".into()),
                    floor: Some(3),
                },
            )
            .await
            .unwrap();
        let (alice, id) = student(&engine, "alice@hall.test").await;
        alice_id = id;
        engine.assign_resident(&admin(), alice_id, r).await.unwrap();
        engine
            .add_to_blacklist(&admin(), "BAD-7".into(), None)
            .await
            .unwrap();

        // churn
        for i in 0..20 {
            let p = engine
                .request_pass(&alice, request(&format!("T-{i}"), "2025-10-01", "2025-10-02"))
                .await
                .unwrap();
            engine.delete_pass(&alice, p.id).await.unwrap();
        }
        keep_pass = engine
            .request_pass(&alice, request("G-1", "2025-10-05", "2025-10-06"))
            .await
            .unwrap()
            .id;
        assert!(engine.wal_appends_since_compact().await > 40);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // after compaction
        engine
            .resolve_pass(&admin(), keep_pass, PassStatus::Approved, None)
            .await
            .unwrap();
    }

    let engine = Engine::new(wal, files).unwrap();
    let room = engine.get_room(&r).unwrap().read().await.clone();
    assert_eq!(room.number, "K1");
    assert_eq!(room.building.as_deref(), Some("East"));
    assert_eq!(room.floor, Some(3));
    assert_eq!(room.occupancy, Some(1));
    assert_eq!(engine.get_account(&alice_id).unwrap().room_id, Some(r));
    let passes = engine.list_passes(&admin(), &PassFilter::default()).await.unwrap();
    assert_eq!(passes.len(), 1);
    assert_eq!(passes[0].id, keep_pass);
    assert_eq!(passes[0].status, PassStatus::Approved);
    assert_eq!(engine.list_blacklist(&admin()).unwrap().len(), 1);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignments_never_overfill() {
    let engine = Arc::new(new_engine("concurrent_assign"));
    let r = room(&engine, "CC1", 3).await;
    let mut students = Vec::new();
    for i in 0..20 {
        students.push(student(&engine, &format!("cc{i}@hall.test")).await.1);
    }

    let mut handles = Vec::new();
    for s in students {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.assign_resident(&Actor::superuser(), s, r).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => ok += 1,
            Err(EngineError::CapacityExceeded(3)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(occupancy_of(&engine, r).await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_passes_admit_one() {
    let engine = Arc::new(new_engine("concurrent_passes"));
    let (alice, _) = student(&engine, "alice@hall.test").await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .request_pass(&alice, request(&format!("G-{i}"), "2025-11-01", "2025-11-03"))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pass_id_is_unique_across_requesters() {
    let engine = Arc::new(new_engine("pass_id_race"));
    let (alice, _) = student(&engine, "alice@hall.test").await;
    let (bob, _) = student(&engine, "bob@hall.test").await;

    for round in 0..50 {
        let id = Ulid::new();
        let spawn = |actor: Actor, id_number: String| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut req = request(&id_number, "2025-12-01", "2025-12-01");
                req.id = id;
                engine.request_pass(&actor, req).await
            })
        };
        let a = spawn(alice, format!("A-{round}"));
        let b = spawn(bob, format!("B-{round}"));
        let results = [a.await.unwrap(), b.await.unwrap()];

        let winners: Vec<&GuestPass> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "round {round}: exactly one request may claim the id");
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EngineError::AlreadyExists(_)))));

        // The surviving pass stays reachable through its owner.
        let owner = if winners[0].requester_id == alice.id.unwrap() { alice } else { bob };
        engine.delete_pass(&owner, id).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposite_moves_do_not_deadlock() {
    let engine = Arc::new(new_engine("opposite_moves"));
    let r1 = room(&engine, "OM1", 2).await;
    let r2 = room(&engine, "OM2", 2).await;
    let (_, a) = student(&engine, "a@hall.test").await;
    let (_, b) = student(&engine, "b@hall.test").await;
    engine.assign_resident(&admin(), a, r1).await.unwrap();
    engine.assign_resident(&admin(), b, r2).await.unwrap();

    let run = |s: Ulid, first: Ulid, second: Ulid| {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                engine.assign_resident(&Actor::superuser(), s, first).await.unwrap();
                engine.assign_resident(&Actor::superuser(), s, second).await.unwrap();
            }
        })
    };
    let ja = run(a, r2, r1);
    let jb = run(b, r1, r2);
    tokio::time::timeout(std::time::Duration::from_secs(30), async {
        ja.await.unwrap();
        jb.await.unwrap();
    })
    .await
    .expect("moves deadlocked");

    assert_eq!(occupancy_of(&engine, r1).await, 1);
    assert_eq!(occupancy_of(&engine, r2).await, 1);
}
