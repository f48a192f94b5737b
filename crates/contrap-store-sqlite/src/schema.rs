//! SQL schema for the Contrap SQLite store.
//!
//! Executed at connection startup. Dates are ISO `YYYY-MM-DD` text, amounts
//! are decimal text (never REAL), timestamps are RFC 3339.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS entities (
    tax_id           TEXT PRIMARY KEY,
    name             TEXT,
    country          TEXT,
    address          TEXT,
    postal_code      TEXT,
    locality         TEXT,
    entity_type      TEXT,
    freshness        INTEGER NOT NULL DEFAULT 0,   -- 0 stub, 1 enriched
    contracts_won    INTEGER NOT NULL DEFAULT 0,
    contracts_issued INTEGER NOT NULL DEFAULT 0,
    total_won        TEXT    NOT NULL DEFAULT '0',
    total_issued     TEXT    NOT NULL DEFAULT '0',
    created_at       TEXT    NOT NULL,
    updated_at       TEXT    NOT NULL
);

-- Lookup tables are append-only.
CREATE TABLE IF NOT EXISTS coded_categories (
    code        TEXT PRIMARY KEY CHECK (length(code) = 8),
    check_digit INTEGER,
    description TEXT,
    prefix      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contract_kinds (
    name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS opportunities (
    external_id            TEXT    NOT NULL,
    year                   INTEGER NOT NULL,
    publication_date       TEXT,
    issuer_tax_id          TEXT REFERENCES entities(tax_id),
    title                  TEXT,
    description            TEXT,
    base_price             TEXT,
    deadline_days          INTEGER,
    submission_deadline    TEXT,
    environmental_criteria INTEGER NOT NULL DEFAULT 0,
    procedure_type         TEXT,
    url                    TEXT,
    updated_at             TEXT    NOT NULL,
    PRIMARY KEY (external_id, year)
);

-- `opportunity_ref*` keep the reference as published so a link that did not
-- resolve can be filled in once the opportunity arrives.
CREATE TABLE IF NOT EXISTS awards (
    award_id             TEXT PRIMARY KEY,
    opportunity_ref      TEXT,
    opportunity_ref_year INTEGER,
    opportunity_id       TEXT,
    opportunity_year     INTEGER,
    issuer_tax_id        TEXT REFERENCES entities(tax_id),
    description          TEXT,
    procedure_type       TEXT,
    location             TEXT,
    legal_basis          TEXT,
    contract_price       TEXT,
    base_price           TEXT,
    publication_date     TEXT,
    signing_date         TEXT,
    decision_date        TEXT,
    closure_date         TEXT,
    execution_days       INTEGER,
    updated_at           TEXT NOT NULL,
    FOREIGN KEY (opportunity_id, opportunity_year)
        REFERENCES opportunities(external_id, year)
);

CREATE TABLE IF NOT EXISTS opportunity_categories (
    external_id TEXT    NOT NULL,
    year        INTEGER NOT NULL,
    code        TEXT    NOT NULL REFERENCES coded_categories(code),
    PRIMARY KEY (external_id, year, code),
    FOREIGN KEY (external_id, year) REFERENCES opportunities(external_id, year)
);

CREATE TABLE IF NOT EXISTS opportunity_kinds (
    external_id TEXT    NOT NULL,
    year        INTEGER NOT NULL,
    kind        TEXT    NOT NULL REFERENCES contract_kinds(name),
    PRIMARY KEY (external_id, year, kind),
    FOREIGN KEY (external_id, year) REFERENCES opportunities(external_id, year)
);

CREATE TABLE IF NOT EXISTS award_categories (
    award_id TEXT NOT NULL REFERENCES awards(award_id),
    code     TEXT NOT NULL REFERENCES coded_categories(code),
    PRIMARY KEY (award_id, code)
);

CREATE TABLE IF NOT EXISTS award_kinds (
    award_id TEXT NOT NULL REFERENCES awards(award_id),
    kind     TEXT NOT NULL REFERENCES contract_kinds(name),
    PRIMARY KEY (award_id, kind)
);

CREATE TABLE IF NOT EXISTS award_parties (
    award_id TEXT NOT NULL REFERENCES awards(award_id),
    tax_id   TEXT NOT NULL REFERENCES entities(tax_id),
    role     TEXT NOT NULL CHECK (role IN ('winner', 'competitor')),
    PRIMARY KEY (award_id, tax_id, role)
);

-- `award_id` is not a foreign key: a modification may arrive before its
-- award and is applied once the award is loaded.
CREATE TABLE IF NOT EXISTS award_modifications (
    modification_id   TEXT PRIMARY KEY,
    award_id          TEXT NOT NULL,
    modified_on       TEXT,
    kind              TEXT,
    description       TEXT,
    justification     TEXT,
    original_value    TEXT,
    new_value         TEXT,
    original_deadline TEXT,
    new_deadline      TEXT,
    updated_at        TEXT NOT NULL
);

-- One row per page that was ever attempted. A committed mark is written in
-- the same transaction as the page's rows.
CREATE TABLE IF NOT EXISTS page_ledger (
    source       TEXT    NOT NULL,
    range_start  TEXT    NOT NULL,
    range_end    TEXT    NOT NULL,
    page_index   INTEGER NOT NULL,
    status       TEXT    NOT NULL CHECK (status IN ('committed', 'failed')),
    record_count INTEGER NOT NULL DEFAULT 0,
    digest       TEXT,
    attempts     INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT,
    updated_at   TEXT    NOT NULL,
    PRIMARY KEY (source, range_start, range_end, page_index)
);

CREATE TABLE IF NOT EXISTS range_ledger (
    source       TEXT    NOT NULL,
    range_start  TEXT    NOT NULL,
    range_end    TEXT    NOT NULL,
    page_count   INTEGER NOT NULL,
    completed_at TEXT    NOT NULL,
    PRIMARY KEY (source, range_start, range_end)
);

CREATE INDEX IF NOT EXISTS entities_freshness_idx ON entities(freshness, updated_at);
CREATE INDEX IF NOT EXISTS opportunities_issuer_idx ON opportunities(issuer_tax_id);
CREATE INDEX IF NOT EXISTS awards_issuer_idx       ON awards(issuer_tax_id);
CREATE INDEX IF NOT EXISTS awards_ref_idx          ON awards(opportunity_ref) WHERE opportunity_id IS NULL;
CREATE INDEX IF NOT EXISTS award_parties_tax_idx   ON award_parties(tax_id, role);
CREATE INDEX IF NOT EXISTS award_mods_award_idx    ON award_modifications(award_id, modified_on);
CREATE INDEX IF NOT EXISTS page_ledger_status_idx  ON page_ledger(status);

PRAGMA user_version = 1;
";
