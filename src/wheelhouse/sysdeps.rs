// Native prerequisites installed before any python package is compiled.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::base::BaseFlavor;

#[derive(Debug, Default, Clone, Copy, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseClient {
    Mysql,
    Postgres,
    #[default]
    None,
}

impl DatabaseClient {
    pub fn dev_packages(&self, flavor: BaseFlavor) -> &'static [&'static str] {
        match (self, flavor) {
            (DatabaseClient::Mysql, BaseFlavor::Alpine) => &["mariadb-dev"],
            (DatabaseClient::Mysql, BaseFlavor::DebianSlim) => &["default-libmysqlclient-dev"],
            (DatabaseClient::Postgres, BaseFlavor::Alpine) => &["postgresql-dev"],
            (DatabaseClient::Postgres, BaseFlavor::DebianSlim) => &["libpq-dev"],
            (DatabaseClient::None, _) => &[],
        }
    }
}

const MYSQL_DRIVERS: &[&str] = &["mysqlclient", "mysql-connector-python", "pymysql"];
const POSTGRES_DRIVERS: &[&str] = &["psycopg2", "psycopg2-binary", "psycopg", "asyncpg"];

pub fn toolchain(flavor: BaseFlavor) -> &'static [&'static str] {
    match flavor {
        BaseFlavor::Alpine => &["build-base", "pkgconf"],
        BaseFlavor::DebianSlim => &["build-essential", "pkg-config"],
    }
}

/// Picks the database client from normalized package names. The first match wins.
pub fn detect_database_client(packages: &[String]) -> DatabaseClient {
    for p in packages {
        if MYSQL_DRIVERS.contains(&p.as_str()) {
            return DatabaseClient::Mysql;
        }
        if POSTGRES_DRIVERS.contains(&p.as_str()) {
            return DatabaseClient::Postgres;
        }
    }
    DatabaseClient::None
}

pub fn system_packages(flavor: BaseFlavor, client: DatabaseClient, extra: &[String]) -> Vec<String> {
    let mut packages: Vec<String> = vec![];
    let native = toolchain(flavor)
        .iter()
        .chain(client.dev_packages(flavor).iter())
        .map(|s| s.to_string());
    for p in native.chain(extra.iter().cloned()) {
        if !packages.contains(&p) {
            packages.push(p);
        }
    }
    packages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_detect_database_client() {
        assert_eq!(
            detect_database_client(&names(&["flask", "mysql-connector-python"])),
            DatabaseClient::Mysql
        );
        assert_eq!(
            detect_database_client(&names(&["fastapi", "asyncpg"])),
            DatabaseClient::Postgres
        );
        assert_eq!(detect_database_client(&names(&["flask"])), DatabaseClient::None);
    }

    #[test]
    fn test_system_packages_alpine_mysql() {
        let pkgs = system_packages(BaseFlavor::Alpine, DatabaseClient::Mysql, &[]);
        assert_eq!(pkgs, names(&["build-base", "pkgconf", "mariadb-dev"]));
    }

    #[test]
    fn test_system_packages_slim_dedups_extras() {
        let pkgs = system_packages(
            BaseFlavor::DebianSlim,
            DatabaseClient::Postgres,
            &names(&["curl", "build-essential"]),
        );
        assert_eq!(
            pkgs,
            names(&["build-essential", "pkg-config", "libpq-dev", "curl"])
        );
    }

    #[test]
    fn test_toolchain_without_client() {
        let pkgs = system_packages(BaseFlavor::DebianSlim, DatabaseClient::None, &[]);
        assert_eq!(pkgs, names(&["build-essential", "pkg-config"]));
    }
}
