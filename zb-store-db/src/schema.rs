// SPDX-License-Identifier: MIT

//! Database schema for the zb store.

/// Object metadata and references.
pub const SCHEMA_SQL: &str = r#"
create table if not exists Objects (
    id               integer primary key autoincrement not null,
    path             text unique not null,
    narHash          text not null,
    narSize          integer not null,
    ca               text,
    registrationTime integer not null
);

create table if not exists Refs (
    referrer  integer not null,
    reference integer not null,
    primary key (referrer, reference),
    foreign key (referrer) references Objects(id) on delete cascade,
    foreign key (reference) references Objects(id) on delete restrict
);

create index if not exists IndexReferrer on Refs(referrer);
create index if not exists IndexReference on Refs(reference);

create trigger if not exists DeleteSelfRefs before delete on Objects
  begin
    delete from Refs where referrer = old.id and reference = old.id;
  end;

create table if not exists Realisations (
    id           integer primary key autoincrement not null,
    drvPath      text not null,
    outputName   text not null,
    outputPath   text not null,
    signer       text,
    signature    text,
    dependencies text not null default ''
);

create unique index if not exists IndexRealisationSigner
    on Realisations(drvPath, outputName, coalesce(signer, ''));
create index if not exists IndexRealisations on Realisations(drvPath, outputName);
"#;

/// Build bookkeeping: one row per realize request, one result row per
/// derivation, append-only chunked logs.
pub const BUILD_SCHEMA_SQL: &str = r#"
create table if not exists Builds (
    id         text primary key not null,
    status     text not null,
    startedAt  integer not null,
    finishedAt integer
);

create index if not exists IndexBuildsStarted on Builds(startedAt desc);

create table if not exists BuildResults (
    buildId text not null,
    drvPath text not null,
    status  text not null,
    logSize integer not null default 0,
    primary key (buildId, drvPath),
    foreign key (buildId) references Builds(id) on delete cascade
);

create table if not exists BuildLogs (
    buildId text not null,
    drvPath text not null,
    chunkId integer not null,
    data    blob not null,
    primary key (buildId, drvPath, chunkId)
);
"#;

/// Schema version, recorded in `user_version`.
pub const SCHEMA_VERSION: i32 = 1;
