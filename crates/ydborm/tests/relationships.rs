mod common;

use asupersync::Cx;
use common::*;
use ydborm::prelude::*;
use ydborm::{RelationshipErrorKind, StatementKind};

fn relationship_kind(err: &Error) -> Option<RelationshipErrorKind> {
    match err {
        Error::Relationship(e) => Some(e.kind),
        _ => None,
    }
}

fn seed_league(driver: &MemoryDriver) {
    seed_team(driver, 1, "Preventers");
    seed_team(driver, 2, "Z-Force");
    seed_team(driver, 3, "Benchwarmers");
    seed_hero(driver, 10, "Rusty-Man", 48, Some(1));
    seed_hero(driver, 11, "Deadpond", 30, Some(1));
    seed_hero(driver, 12, "Spider-Boy", 16, Some(2));
    seed_hero(driver, 13, "Loner", 40, None);
}

#[test]
fn include_loads_children_in_one_extra_query_with_backrefs() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_league(&driver);
        let mut session = session(&driver);

        let before = driver.statement_count();
        let teams = unwrap_outcome(
            select!(Team)
                .order_by(&["id"])
                .unwrap()
                .include("heroes")
                .unwrap()
                .all(&cx, &mut session)
                .await,
        );
        assert_eq!(driver.statement_count() - before, 2);
        assert_eq!(session.stats().eager_loads, 1);

        let preventers = teams[0].related_many::<Hero>("heroes").get().unwrap();
        let names: Vec<String> = preventers.iter().map(|h| h.read().name.clone()).collect();
        // Declared order: name asc
        assert_eq!(names, vec!["Deadpond", "Rusty-Man"]);

        // Teams without heroes still get a loaded, empty collection
        assert!(teams[2].related_many::<Hero>("heroes").get().unwrap().is_empty());

        // Backrefs point at the canonical parent without further queries
        let parent = preventers[0].related_one::<Team>("team").get().unwrap().unwrap();
        assert!(parent.ptr_eq(&teams[0]));
        assert_eq!(driver.statement_count() - before, 2);

        // Children joined the identity map
        let deadpond = session
            .get_from_identity_map::<Hero>(vec![Value::Int64(11)])
            .unwrap();
        assert!(deadpond.ptr_eq(&preventers[0]));
    });
}

#[test]
fn include_many_to_one_batches_parents() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_league(&driver);
        let mut session = session(&driver);

        let before = driver.statement_count();
        let heroes = unwrap_outcome(
            select!(Hero)
                .order_by(&["id"])
                .unwrap()
                .include("team")
                .unwrap()
                .all(&cx, &mut session)
                .await,
        );
        assert_eq!(driver.statement_count() - before, 2);

        let rusty_team = heroes[0].related_one::<Team>("team").get().unwrap().unwrap();
        let deadpond_team = heroes[1].related_one::<Team>("team").get().unwrap().unwrap();
        assert!(rusty_team.ptr_eq(&deadpond_team));
        assert_eq!(rusty_team.read().name, "Preventers");

        // Null foreign key: loaded as empty
        assert_eq!(heroes[3].related_one::<Team>("team").get().map(|t| t.is_none()), Some(true));
    });
}

#[test]
fn include_with_no_parents_issues_no_query() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        let mut session = session(&driver);

        let before = driver.statement_count();
        let teams = unwrap_outcome(
            select!(Team)
                .include("heroes")
                .unwrap()
                .all(&cx, &mut session)
                .await,
        );
        assert!(teams.is_empty());
        assert_eq!(driver.statement_count() - before, 1);
    });
}

#[test]
fn lazy_collection_loads_once() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_league(&driver);
        let mut session = session(&driver);

        let team = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).unwrap();
        let heroes = team.related_many::<Hero>("heroes");
        assert!(!heroes.is_loaded());

        let before = driver.statement_count();
        let loaded = unwrap_outcome(heroes.load(&cx, &mut session).await);
        assert_eq!(loaded.len(), 2);
        assert_eq!(driver.statement_count() - before, 1);
        assert_eq!(session.stats().lazy_loads, 1);

        // Second access is served from the slot
        let again = unwrap_outcome(heroes.load(&cx, &mut session).await);
        assert!(again[0].ptr_eq(&loaded[0]));
        assert_eq!(driver.statement_count() - before, 1);

        let back = loaded[0].related_one::<Team>("team").get().unwrap().unwrap();
        assert!(back.ptr_eq(&team));
    });
}

#[test]
fn lazy_parent_with_null_key_skips_io() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_league(&driver);
        let mut session = session(&driver);

        let loner = unwrap_outcome(session.get::<Hero>(&cx, 13_i64).await).unwrap();
        let before = driver.statement_count();
        let team = unwrap_outcome(loner.related_one::<Team>("team").load(&cx, &mut session).await);
        assert!(team.is_none());
        assert_eq!(driver.statement_count(), before);

        let spider = unwrap_outcome(session.get::<Hero>(&cx, 12_i64).await).unwrap();
        let team = unwrap_outcome(spider.related_one::<Team>("team").load(&cx, &mut session).await)
            .unwrap();
        assert_eq!(team.read().name, "Z-Force");
        // The parent is the canonical instance for its key
        let direct = unwrap_outcome(session.get::<Team>(&cx, 2_i64).await).unwrap();
        assert!(direct.ptr_eq(&team));
    });
}

#[test]
fn detached_instances_cannot_load() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_league(&driver);
        let mut session = session(&driver);

        let team = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).unwrap();
        let other = unwrap_outcome(session.get::<Team>(&cx, 2_i64).await).unwrap();
        unwrap_outcome(team.related_many::<Hero>("heroes").load(&cx, &mut session).await);
        unwrap_outcome(session.close(&cx).await);
        assert!(!team.is_attached());

        // A new session on the same store cannot resolve the old instance
        let mut fresh = common::session(&driver);
        let err = expect_err(
            other
                .related_many::<Hero>("heroes")
                .load(&cx, &mut fresh)
                .await,
        );
        assert_eq!(relationship_kind(&err), Some(RelationshipErrorKind::Detached));

        // Values loaded before close stay readable
        let cached = team.related_many::<Hero>("heroes").get().unwrap();
        assert_eq!(cached.len(), 2);
    });
}

#[test]
fn instances_of_another_session_are_rejected() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_league(&driver);
        let mut one = session(&driver);
        let mut two = session(&driver);

        let team = unwrap_outcome(one.get::<Team>(&cx, 1_i64).await).unwrap();
        let err = expect_err(team.related_many::<Hero>("heroes").load(&cx, &mut two).await);
        assert_eq!(
            relationship_kind(&err),
            Some(RelationshipErrorKind::ForeignSession)
        );
    });
}

#[test]
fn unresolved_target_fails_only_on_access() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_league(&driver);
        let mut session = session(&driver);

        // Hero declares `mentor -> Mentor`; registering and querying Hero works
        let hero = unwrap_outcome(session.get::<Hero>(&cx, 10_i64).await).unwrap();

        let mentor = hero.related_one::<Team>("mentor");
        let err = expect_err(mentor.load(&cx, &mut session).await);
        assert_eq!(
            relationship_kind(&err),
            Some(RelationshipErrorKind::UnresolvedTarget)
        );

        let err = expect_err(
            select!(Hero)
                .include("mentor")
                .unwrap()
                .all(&cx, &mut session)
                .await,
        );
        assert_eq!(
            relationship_kind(&err),
            Some(RelationshipErrorKind::UnresolvedTarget)
        );
    });
}

#[test]
fn wrong_target_type_is_a_mismatch() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_league(&driver);
        let mut session = session(&driver);

        let hero = unwrap_outcome(session.get::<Hero>(&cx, 10_i64).await).unwrap();
        let err = expect_err(hero.related_one::<Hero>("team").load(&cx, &mut session).await);
        assert_eq!(
            relationship_kind(&err),
            Some(RelationshipErrorKind::TargetMismatch)
        );
    });
}

#[test]
fn eager_child_query_uses_one_in_parameter() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_league(&driver);
        let mut session = session(&driver);

        unwrap_outcome(
            select!(Team)
                .include("heroes")
                .unwrap()
                .all(&cx, &mut session)
                .await,
        );
        let cache = session.statement_cache();
        assert_eq!(cache.len(), 2);

        // Re-running with a different parent set reuses both statements
        unwrap_outcome(
            select!(Team)
                .filter(eq("id", 1_i64))
                .unwrap()
                .include("heroes")
                .unwrap()
                .all(&cx, &mut session)
                .await,
        );
        assert_eq!(session.statement_cache().len(), 3);
        let select_shape = select!(Team).compile().shape;
        assert_eq!(select_shape.kind, StatementKind::Select);
        assert!(session.statement_cache().contains(&select_shape));
    });
}
