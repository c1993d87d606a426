#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use std::future::Future;
use ydborm::prelude::*;

pub fn block_on<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got Ok"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: i64,
    pub name: String,
}

impl Model for Team {
    const MODEL_NAME: &'static str = "Team";
    const TABLE_NAME: &'static str = "teams";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[one_to_many("heroes", "Hero", "team_id")
        .backref("team")
        .order_by("name asc")];

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", ColumnType::Int64).primary_key(true),
            FieldInfo::new("name", ColumnType::Utf8),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }
}

/// `mentor` points at a model no test binary registers.
#[derive(Debug, Clone, PartialEq)]
pub struct Hero {
    pub id: i64,
    pub name: String,
    pub age: i32,
    pub team_id: Option<i64>,
    pub mentor_id: Option<i64>,
}

impl Model for Hero {
    const MODEL_NAME: &'static str = "Hero";
    const TABLE_NAME: &'static str = "heroes";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[
        many_to_one("team", "Team", "team_id"),
        many_to_one("mentor", "Mentor", "mentor_id"),
    ];

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", ColumnType::Int64).primary_key(true),
            FieldInfo::new("name", ColumnType::Utf8),
            FieldInfo::new("age", ColumnType::Int32),
            FieldInfo::new("team_id", ColumnType::Int64).nullable(true),
            FieldInfo::new("mentor_id", ColumnType::Int64).nullable(true),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("age", self.age.into()),
            ("team_id", self.team_id.into()),
            ("mentor_id", self.mentor_id.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            age: row.get_named("age")?,
            team_id: row.get_named("team_id")?,
            mentor_id: row.get_named("mentor_id")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }
}

pub fn hero(id: i64, name: &str, age: i32, team_id: Option<i64>) -> Instance<Hero> {
    Instance::new(Hero {
        id,
        name: name.to_string(),
        age,
        team_id,
        mentor_id: None,
    })
}

pub fn team(id: i64, name: &str) -> Instance<Team> {
    Instance::new(Team {
        id,
        name: name.to_string(),
    })
}

/// A driver with both tables created.
pub fn driver() -> MemoryDriver {
    let driver = MemoryDriver::new();
    driver.create_table_for::<Team>();
    driver.create_table_for::<Hero>();
    driver
}

/// A session over `driver` with both models registered.
pub fn session(driver: &MemoryDriver) -> Session<MemoryDriver> {
    let session = Session::new(driver.clone());
    session.register::<Team>().expect("register Team");
    session.register::<Hero>().expect("register Hero");
    session
}

/// Store rows directly, without going through a session.
pub fn seed_hero(driver: &MemoryDriver, id: i64, name: &str, age: i32, team_id: Option<i64>) {
    driver
        .insert_row(
            "heroes",
            &Row::from_pairs([
                ("id", Value::Int64(id)),
                ("name", Value::Text(name.to_string())),
                ("age", Value::Int32(age)),
                ("team_id", team_id.into()),
                ("mentor_id", Value::Null),
            ]),
        )
        .expect("seed hero");
}

pub fn seed_team(driver: &MemoryDriver, id: i64, name: &str) {
    driver
        .insert_row(
            "teams",
            &Row::from_pairs([
                ("id", Value::Int64(id)),
                ("name", Value::Text(name.to_string())),
            ]),
        )
        .expect("seed team");
}
