//! TMDB grabber: movie metadata and poster artwork.
//!
//! Two requests per file: a title search, then the movie details. The poster
//! is not fetched here — its URL is queued for the downloader stage.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::DlKind;
use crate::error::{Result, SkaldError};
use crate::filedata::FileData;
use crate::meta::{keys, Lang, PriorityList};
use crate::net::HttpClient;

use super::{Caps, Grabber, GrabberParams};

const API_BASE: &str = "https://api.themoviedb.org/3";
const IMAGE_BASE: &str = "https://image.tmdb.org/t/p/w500";

#[derive(Debug, Deserialize)]
struct SearchPage {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Movie {
    title: Option<String>,
    overview: Option<String>,
    release_date: Option<String>,
    vote_average: Option<f64>,
    runtime: Option<i64>,
    budget: Option<i64>,
    revenue: Option<i64>,
    poster_path: Option<String>,
    #[serde(default)]
    genres: Vec<Named>,
    #[serde(default)]
    production_companies: Vec<Named>,
    #[serde(default)]
    production_countries: Vec<Country>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Country {
    name: String,
}

pub struct TmdbGrabber {
    api_key: String,
    http: Option<Arc<HttpClient>>,
}

impl TmdbGrabber {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http: None,
        }
    }

    fn http(&self) -> Result<&HttpClient> {
        self.http.as_deref().ok_or_else(|| SkaldError::Grab {
            name: "tmdb",
            message: "grabber not initialised".into(),
        })
    }

    fn search(&self, title: &str) -> Result<i64> {
        let page: SearchPage = self.http()?.get_json(
            &format!("{API_BASE}/search/movie"),
            &[("api_key", self.api_key.as_str()), ("query", title)],
        )?;
        page.results
            .first()
            .map(|r| r.id)
            .ok_or(SkaldError::GrabMiss)
    }

    fn details(&self, id: i64) -> Result<Movie> {
        self.http()?.get_json(
            &format!("{API_BASE}/movie/{id}"),
            &[("api_key", self.api_key.as_str())],
        )
    }

    fn apply(movie: &Movie, data: &FileData, pl: &PriorityList) {
        let mut add = |name: &str, value: &str| {
            data.add_grabber_meta(name, value, Lang::Undef, pl.get(name));
        };

        if let Some(title) = &movie.title {
            add(keys::TITLE_ALTERNATIVE, title);
        }
        if let Some(overview) = &movie.overview {
            add(keys::SYNOPSIS, overview);
        }
        if let Some(date) = &movie.release_date {
            add(keys::DATE, date);
        }
        if let Some(rating) = movie.vote_average {
            add(keys::RATING, &format!("{rating:.1}"));
        }
        if let Some(runtime) = movie.runtime {
            add(keys::RUNTIME, &runtime.to_string());
        }
        if let Some(budget) = movie.budget.filter(|b| *b > 0) {
            add("budget", &budget.to_string());
        }
        if let Some(revenue) = movie.revenue.filter(|r| *r > 0) {
            add("revenue", &revenue.to_string());
        }
        for genre in &movie.genres {
            add(keys::GENRE, &genre.name);
        }
        for studio in &movie.production_companies {
            add(keys::STUDIO, &studio.name);
        }
        for country in &movie.production_countries {
            add(keys::COUNTRY, &country.name);
        }

        if let Some(poster) = &movie.poster_path {
            let stem = data
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "poster".into());
            let ext = poster.rsplit('.').next().unwrap_or("jpg");
            data.add_download(
                &format!("{IMAGE_BASE}{poster}"),
                DlKind::Cover,
                &format!("{stem}-cover.{ext}"),
            );
        }
    }
}

impl Grabber for TmdbGrabber {
    fn name(&self) -> &'static str {
        "tmdb"
    }

    fn caps(&self) -> Caps {
        Caps::VIDEO
    }

    fn init(&mut self, params: &GrabberParams) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(SkaldError::Grab {
                name: "tmdb",
                message: "missing API key".into(),
            });
        }
        self.http = Some(Arc::clone(&params.http));
        Ok(())
    }

    fn uninit(&mut self) {
        self.http = None;
    }

    fn grab(&mut self, data: &FileData, pl: &PriorityList) -> Result<()> {
        let title = data
            .meta_parser()
            .get(keys::TITLE)
            .map(|e| e.value.clone())
            .ok_or(SkaldError::GrabMiss)?;

        trace!(title, "tmdb lookup");
        let id = self.search(&title)?;
        let movie = self.details(id)?;
        debug!(title, id, "tmdb match");
        Self::apply(&movie, data, pl);
        Ok(())
    }
}
