//! Reverse proxy routing: which requests are served from the published
//! static directory and which go to the backend

use crate::config::RuntimeConfig;
use crate::health::connect_host;
use crate::layout::dir_has_entries;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("no static directory configured")]
    NoStaticDir,

    #[error("static directory {0} is missing or empty")]
    StaticDirEmpty(String),
}

/// Where a request path is served from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A file inside the static directory
    Static(PathBuf),
    /// The backend, as `http://host:port/path`
    Upstream(String),
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    static_dir: Option<PathBuf>,
    upstream: String,
    timeout_secs: u64,
}

impl RouteTable {
    pub fn new(static_dir: Option<&Path>, config: &RuntimeConfig) -> Self {
        Self {
            static_dir: static_dir.map(Path::to_path_buf),
            upstream: format!("{}:{}", connect_host(&config.host), config.port),
            timeout_secs: config.request_timeout_secs,
        }
    }

    pub fn static_dir(&self) -> Option<&Path> {
        self.static_dir.as_deref()
    }

    /// `host:port` the router proxies to
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// The router may only start once the static directory holds the build
    pub fn ensure_static_ready(&self) -> Result<&Path, RouterError> {
        let dir = self.static_dir.as_deref().ok_or(RouterError::NoStaticDir)?;
        if dir_has_entries(dir) {
            Ok(dir)
        } else {
            Err(RouterError::StaticDirEmpty(dir.display().to_string()))
        }
    }

    /// Resolve a request target (path plus optional query)
    pub fn resolve(&self, target: &str) -> Route {
        let path = target.split(['?', '#']).next().unwrap_or("/");

        if let Some(file) = self.static_file(path) {
            return Route::Static(file);
        }
        let path = if path.starts_with('/') {
            target.to_string()
        } else {
            format!("/{}", target)
        };
        Route::Upstream(format!("http://{}{}", self.upstream, path))
    }

    fn static_file(&self, path: &str) -> Option<PathBuf> {
        let dir = self.static_dir.as_deref()?;
        let relative = Path::new(path.trim_start_matches('/'));

        // Only plain names; anything that could climb out of the directory
        // goes to the backend untouched
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return None;
        }

        let mut file = dir.join(relative);
        if file.is_dir() {
            file.push("index.html");
        }
        file.is_file().then_some(file)
    }

    /// Render an nginx `server` block implementing this table
    pub fn render_nginx(&self, listen: u16) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "server {{");
        let _ = writeln!(out, "    listen {};", listen);

        match &self.static_dir {
            Some(dir) => {
                let _ = writeln!(out, "    root {};", dir.display());
                let _ = writeln!(out, "    index index.html;");
                let _ = writeln!(out);
                let _ = writeln!(out, "    location / {{");
                let _ = writeln!(out, "        try_files $uri $uri/ @backend;");
                let _ = writeln!(out, "    }}");
                let _ = writeln!(out);
                let _ = writeln!(out, "    location @backend {{");
            }
            None => {
                let _ = writeln!(out, "    location / {{");
            }
        }

        let _ = writeln!(out, "        proxy_pass http://{};", self.upstream);
        let _ = writeln!(out, "        proxy_http_version 1.1;");
        let _ = writeln!(out, "        proxy_set_header Host $host;");
        let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
        let _ = writeln!(
            out,
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
        );
        let _ = writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;");
        let _ = writeln!(out, "        proxy_read_timeout {}s;", self.timeout_secs);
        let _ = writeln!(out, "    }}");
        let _ = writeln!(out, "}}");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hosting;
    use std::fs;

    fn runtime() -> RuntimeConfig {
        RuntimeConfig::defaults(Hosting::Constrained)
    }

    fn built_site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        fs::create_dir(dir.path().join("assets")).unwrap();
        fs::write(dir.path().join("assets/app.js"), "console.log(1)").unwrap();
        dir
    }

    #[test]
    fn test_static_paths_resolve_to_files() {
        let site = built_site();
        let table = RouteTable::new(Some(site.path()), &runtime());

        assert_eq!(
            table.resolve("/"),
            Route::Static(site.path().join("index.html"))
        );
        assert_eq!(
            table.resolve("/assets/app.js?v=3"),
            Route::Static(site.path().join("assets/app.js"))
        );
    }

    #[test]
    fn test_other_paths_go_upstream() {
        let site = built_site();
        let table = RouteTable::new(Some(site.path()), &runtime());

        assert_eq!(
            table.resolve("/health"),
            Route::Upstream("http://127.0.0.1:8000/health".to_string())
        );
        assert_eq!(
            table.resolve("/api/items?page=2"),
            Route::Upstream("http://127.0.0.1:8000/api/items?page=2".to_string())
        );
    }

    #[test]
    fn test_traversal_never_served_from_disk() {
        let site = built_site();
        let table = RouteTable::new(Some(site.path().join("assets").as_path()), &runtime());

        assert!(matches!(table.resolve("/../index.html"), Route::Upstream(_)));
        assert!(matches!(table.resolve("/./app.js"), Route::Upstream(_)));
    }

    #[test]
    fn test_without_static_dir_everything_is_upstream() {
        let mut config = runtime();
        config.host = "10.0.0.2".to_string();
        config.port = 9000;
        let table = RouteTable::new(None, &config);

        assert_eq!(table.upstream(), "10.0.0.2:9000");
        assert_eq!(
            table.resolve("/"),
            Route::Upstream("http://10.0.0.2:9000/".to_string())
        );
        assert_eq!(table.ensure_static_ready(), Err(RouterError::NoStaticDir));
    }

    #[test]
    fn test_ensure_static_ready() {
        let empty = tempfile::tempdir().unwrap();
        let table = RouteTable::new(Some(empty.path()), &runtime());
        assert!(matches!(
            table.ensure_static_ready(),
            Err(RouterError::StaticDirEmpty(_))
        ));

        let site = built_site();
        let table = RouteTable::new(Some(site.path()), &runtime());
        assert_eq!(table.ensure_static_ready(), Ok(site.path()));
    }

    #[test]
    fn test_render_nginx() {
        let site = built_site();
        let table = RouteTable::new(Some(site.path()), &runtime());
        let conf = table.render_nginx(80);

        assert!(conf.starts_with("server {\n    listen 80;\n"));
        assert!(conf.contains(&format!("root {};", site.path().display())));
        assert!(conf.contains("try_files $uri $uri/ @backend;"));
        assert!(conf.contains("proxy_pass http://127.0.0.1:8000;"));
        assert!(conf.contains("proxy_read_timeout 120s;"));
        assert_eq!(conf.matches('{').count(), conf.matches('}').count());

        let api_only = RouteTable::new(None, &runtime()).render_nginx(8080);
        assert!(!api_only.contains("@backend"));
        assert!(api_only.contains("location / {\n        proxy_pass"));
    }
}
