mod common;

use asupersync::Cx;
use common::*;
use std::sync::Arc;
use ydborm::prelude::*;
use ydborm::{Driver, StatementCache, TransactionErrorKind};

#[test]
fn same_row_yields_same_instance_and_refreshes_in_place() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_hero(&driver, 1, "Deadpond", 30, None);
        seed_hero(&driver, 2, "Rusty-Man", 48, None);
        let mut session = session(&driver);

        let q = select!(Hero).order_by(&["id"]).unwrap();
        let first = unwrap_outcome(q.all(&cx, &mut session).await);
        let second = unwrap_outcome(q.all(&cx, &mut session).await);
        assert_eq!(first.len(), 2);
        assert!(first[0].ptr_eq(&second[0]));
        assert!(first[1].ptr_eq(&second[1]));

        let by_get = unwrap_outcome(session.get::<Hero>(&cx, 2_i64).await).unwrap();
        assert!(by_get.ptr_eq(&first[1]));

        // Another writer changes the row; re-querying refreshes the canonical instance
        seed_hero(&driver, 1, "Deadpond", 31, None);
        let again = unwrap_outcome(
            select!(Hero)
                .filter(eq("id", 1_i64))
                .unwrap()
                .one(&cx, &mut session)
                .await,
        );
        assert!(again.ptr_eq(&first[0]));
        assert_eq!(first[0].read().age, 31);
    });
}

#[test]
fn identity_is_per_session() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_hero(&driver, 1, "Deadpond", 30, None);
        let mut one = session(&driver);
        let mut two = session(&driver);

        let a = unwrap_outcome(session_get(&cx, &mut one, 1).await);
        let b = unwrap_outcome(session_get(&cx, &mut two, 1).await);
        assert!(!a.ptr_eq(&b));
        assert_eq!(a.owner(), Some(one.id()));
        assert_eq!(b.owner(), Some(two.id()));
    });
}

async fn session_get(
    cx: &Cx,
    session: &mut Session<MemoryDriver>,
    id: i64,
) -> Outcome<Instance<Hero>, Error> {
    select!(Hero)
        .filter(eq("id", id))
        .unwrap()
        .one(cx, session)
        .await
}

#[test]
fn first_returns_leading_row_or_none() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        for (id, name, age) in [(1, "c", 30), (2, "a", 20), (3, "b", 40)] {
            seed_hero(&driver, id, name, age, None);
        }
        let mut session = session(&driver);

        let youngest = unwrap_outcome(
            select!(Hero)
                .order_by(&["age asc"])
                .unwrap()
                .first(&cx, &mut session)
                .await,
        )
        .unwrap();
        assert_eq!(youngest.read().name, "a");

        // A user limit of zero stays zero
        let none = unwrap_outcome(select!(Hero).limit(0).first(&cx, &mut session).await);
        assert!(none.is_none());

        let missing = unwrap_outcome(
            select!(Hero)
                .filter(gt("age", 100))
                .unwrap()
                .first(&cx, &mut session)
                .await,
        );
        assert!(missing.is_none());
        // Only the first row was hydrated
        assert_eq!(session.tracked_count(), 1);
    });
}

#[test]
fn one_requires_exactly_one_row() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_hero(&driver, 1, "Deadpond", 30, None);
        seed_hero(&driver, 2, "Spider-Boy", 30, None);
        let mut session = session(&driver);

        match select!(Hero)
            .filter(eq("age", 30))
            .unwrap()
            .one(&cx, &mut session)
            .await
        {
            Outcome::Err(Error::MultipleResultsFound(ctx)) => {
                assert_eq!(ctx.model, "Hero");
                assert_eq!(ctx.predicate, "age = ?");
            }
            Outcome::Err(e) => panic!("expected MultipleResultsFound, got {e}"),
            _ => panic!("expected MultipleResultsFound"),
        }

        let err = expect_err(
            select!(Hero)
                .filter(eq("age", 99))
                .unwrap()
                .one(&cx, &mut session)
                .await,
        );
        assert!(matches!(err, Error::NoResultFound(_)));

        let none = unwrap_outcome(
            select!(Hero)
                .filter(eq("age", 99))
                .unwrap()
                .one_or_none(&cx, &mut session)
                .await,
        );
        assert!(none.is_none());
    });
}

#[test]
fn count_exists_and_distinct() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_hero(&driver, 1, "a", 30, None);
        seed_hero(&driver, 2, "b", 30, None);
        seed_hero(&driver, 3, "c", 40, None);
        let mut session = session(&driver);

        assert_eq!(unwrap_outcome(select!(Hero).count(&cx, &mut session).await), 3);
        let thirty = select!(Hero).filter(eq("age", 30)).unwrap();
        assert_eq!(unwrap_outcome(thirty.count(&cx, &mut session).await), 2);
        assert!(unwrap_outcome(thirty.exists(&cx, &mut session).await));

        let ages = select!(Hero).select(&["age"]).unwrap().distinct();
        assert_eq!(unwrap_outcome(ages.count(&cx, &mut session).await), 2);

        let rows = unwrap_outcome(ages.order_by(&["age desc"]).unwrap().rows(&cx, &mut session).await);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_named::<i32>("age").unwrap(), 40);
        assert!(!rows[0].contains_column("name"));

        // Partial projections do not hydrate instances
        let err = expect_err(ages.all(&cx, &mut session).await);
        assert!(matches!(err, Error::StatementCompilation(_)));
        assert_eq!(session.tracked_count(), 0);
    });
}

#[test]
fn builder_errors_surface_before_execution() {
    assert!(matches!(
        select!(Hero).filter(eq("power", 1)),
        Err(Error::StatementCompilation(_))
    ));
    assert!(matches!(
        select!(Hero).filter(like("age", "1%")),
        Err(Error::StatementCompilation(_))
    ));
    assert!(matches!(
        select!(Hero).order_by(&["age sideways"]),
        Err(Error::StatementCompilation(_))
    ));
    assert!(matches!(
        select!(Hero).include("sidekicks"),
        Err(Error::Relationship(_))
    ));
}

#[test]
fn statement_cache_is_keyed_by_shape() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        seed_hero(&driver, 1, "a", 30, None);
        let mut session = session(&driver);

        let before = driver.prepare_count();
        for age in [10, 20, 30] {
            unwrap_outcome(
                select!(Hero)
                    .filter(gt("age", age))
                    .unwrap()
                    .all(&cx, &mut session)
                    .await,
            );
        }
        assert_eq!(session.statement_cache().len(), 1);
        assert_eq!(driver.prepare_count(), before + 1);
        assert_eq!(session.stats().cache_hits, 2);

        // A different operator is a different shape
        unwrap_outcome(
            select!(Hero)
                .filter(lt("age", 30))
                .unwrap()
                .all(&cx, &mut session)
                .await,
        );
        assert_eq!(session.statement_cache().len(), 2);

        // IN lists of different lengths share one statement
        for ids in [vec![1_i64], vec![1, 2, 3]] {
            unwrap_outcome(
                select!(Hero)
                    .filter(in_("id", ids))
                    .unwrap()
                    .all(&cx, &mut session)
                    .await,
            );
        }
        assert_eq!(session.statement_cache().len(), 3);
    });
}

#[test]
fn statement_cache_evicts_least_recently_used() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        let cache = Arc::new(StatementCache::new(2));
        let mut session = session(&driver).with_statement_cache(Arc::clone(&cache));

        let by_id = select!(Hero).filter(eq("id", 1_i64)).unwrap();
        let by_name = select!(Hero).filter(eq("name", "a")).unwrap();
        let by_age = select!(Hero).filter(eq("age", 1)).unwrap();

        unwrap_outcome(by_id.all(&cx, &mut session).await);
        unwrap_outcome(by_name.all(&cx, &mut session).await);
        unwrap_outcome(by_age.all(&cx, &mut session).await);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&by_id.compile().shape));
        assert_eq!(driver.prepare_count(), 3);

        // by_age is cached; by_id has to be prepared again and evicts by_name
        unwrap_outcome(by_age.all(&cx, &mut session).await);
        assert_eq!(driver.prepare_count(), 3);
        unwrap_outcome(by_id.all(&cx, &mut session).await);
        assert_eq!(driver.prepare_count(), 4);
        assert!(cache.contains(&by_age.compile().shape));
        assert!(!cache.contains(&by_name.compile().shape));
    });
}

#[test]
fn shared_cache_keeps_statements_per_connection() {
    let cx = Cx::for_testing();
    block_on(async {
        let a = MemoryDriver::shared("/shared-cache-connections");
        a.create_table_for::<Team>();
        a.create_table_for::<Hero>();
        let b = MemoryDriver::shared("/shared-cache-connections");
        seed_team(&a, 1, "Preventers");

        let cache = Arc::new(StatementCache::new(16));
        let mut one = session(&a).with_statement_cache(Arc::clone(&cache));
        let mut two = session(&b).with_statement_cache(Arc::clone(&cache));

        unwrap_outcome(select!(Team).all(&cx, &mut one).await);
        assert_eq!(unwrap_outcome(select!(Hero).count(&cx, &mut two).await), 0);

        // Connection b prepares its own copy instead of reusing a's handle
        let teams = unwrap_outcome(select!(Team).all(&cx, &mut two).await);
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].read().name, "Preventers");
        assert_eq!(b.prepare_count(), 2);
        assert_eq!(cache.len(), 3);
        let shape = select!(Team).compile().shape;
        assert!(cache.contains_for(a.connection_id(), &shape));
        assert!(cache.contains_for(b.connection_id(), &shape));

        unwrap_outcome(select!(Team).all(&cx, &mut one).await);
        assert_eq!(a.prepare_count(), 1);
        assert_eq!(cache.hit_count(&shape), Some(1));
    });
}

#[test]
fn insert_query_upsert_delete_round_trip() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        let mut session = session(&driver);

        let deadpond = unwrap_outcome(session.add(&cx, &hero(1, "Deadpond", 30, None)).await);
        unwrap_outcome(session.add(&cx, &hero(2, "Spider-Boy", 16, None)).await);
        assert_eq!(driver.table_rows("heroes").len(), 2);

        let adults = unwrap_outcome(
            select!(Hero)
                .filter(ge("age", 18))
                .unwrap()
                .all(&cx, &mut session)
                .await,
        );
        assert_eq!(adults.len(), 1);
        assert!(adults[0].ptr_eq(&deadpond));

        deadpond.write().age = 31;
        let canonical = unwrap_outcome(session.upsert(&cx, &deadpond).await);
        assert!(canonical.ptr_eq(&deadpond));
        let stored = driver.table_rows("heroes");
        assert_eq!(stored[0].get_named::<i32>("age").unwrap(), 31);

        unwrap_outcome(session.delete(&cx, &deadpond).await);
        assert!(!deadpond.is_attached());
        assert!(session.get_from_identity_map::<Hero>(vec![Value::Int64(1)]).is_none());
        assert_eq!(driver.table_rows("heroes").len(), 1);
        assert!(unwrap_outcome(session.get::<Hero>(&cx, 1_i64).await).is_none());

        unwrap_outcome(session.close(&cx).await);
        assert!(driver.is_closed());
    });
}

#[test]
fn commit_without_scope_is_not_active() {
    let cx = Cx::for_testing();
    block_on(async {
        let driver = driver();
        let mut session = session(&driver);
        match expect_err(session.commit(&cx).await) {
            Error::Transaction(e) => assert_eq!(e.kind, TransactionErrorKind::NotActive),
            other => panic!("expected transaction error, got {other:?}"),
        }
    });
}
