//! Public-facing views and generated repository artifacts.
//!
//! Pages are rendered with Handlebars and pushed to the `gh-pages` branch;
//! `datapackage.json` and `_config.yml` go alongside the data.

use handlebars::Handlebars;
use serde::Serialize;
use serde_json::json;

use crate::dataset::{Dataset, DatasetFile};
use crate::error::ViewError;
use crate::repository::RepoFile;

/// Branch that serves the public views.
pub const PAGES_BRANCH: &str = "gh-pages";

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>{{name}}</title>
</head>
<body>
  <header>
    {{#if owner_avatar}}<img class="avatar" src="{{owner_avatar}}" alt="{{owner}}">{{/if}}
    <h1>{{name}}</h1>
    {{#if publisher_name}}<p class="publisher">Published by {{#if publisher_url}}<a href="{{publisher_url}}">{{publisher_name}}</a>{{else}}{{publisher_name}}{{/if}}</p>{{/if}}
  </header>
  {{#if description}}<p class="description">{{description}}</p>{{/if}}
  <dl>
    {{#if license}}<dt>License</dt><dd>{{license}}</dd>{{/if}}
    {{#if frequency}}<dt>Updated</dt><dd>{{frequency}}</dd>{{/if}}
  </dl>
  <h2>Data files</h2>
  <ul>
    {{#each files}}
    <li><a href="{{page}}">{{title}}</a> (<a href="{{download}}">{{filename}}</a>){{#if description}} {{description}}{{/if}}</li>
    {{/each}}
  </ul>
  <footer><a href="{{github_url}}">View on GitHub</a></footer>
</body>
</html>
"#;

const FILE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>{{title}} | {{dataset}}</title>
</head>
<body>
  <p><a href="{{dataset_url}}">{{dataset}}</a></p>
  <h1>{{title}}</h1>
  {{#if description}}<p class="description">{{description}}</p>{{/if}}
  {{#if schema}}<p class="schema">Validated against <a href="{{schema_url}}">{{schema}}</a></p>{{/if}}
  <p><a href="{{download}}">Download {{filename}}</a></p>
</body>
</html>
"#;

#[derive(Serialize)]
struct FileLink {
    title: String,
    filename: String,
    description: Option<String>,
    page: String,
    download: String,
}

/// Renders dataset pages and artifacts.
pub struct ViewRenderer {
    handlebars: Handlebars<'static>,
}

impl ViewRenderer {
    pub fn new() -> Result<Self, ViewError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        for (name, source) in [("index", INDEX_TEMPLATE), ("file", FILE_TEMPLATE)] {
            handlebars
                .register_template_string(name, source)
                .map_err(|e| ViewError::Render {
                    template: name.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(Self { handlebars })
    }

    fn render(&self, template: &str, data: &serde_json::Value) -> Result<String, ViewError> {
        self.handlebars
            .render(template, data)
            .map_err(|e| ViewError::Render {
                template: template.to_string(),
                message: e.to_string(),
            })
    }

    pub fn render_index(&self, dataset: &Dataset) -> Result<String, ViewError> {
        let files: Vec<FileLink> = dataset
            .files
            .iter()
            .map(|file| FileLink {
                title: file.title.clone(),
                filename: file.effective_filename(),
                description: file.description.clone(),
                page: page_path(file),
                download: file.github_url(dataset),
            })
            .collect();
        let meta = &dataset.metadata;
        let data = json!({
            "name": meta.name,
            "description": meta.description,
            "publisher_name": meta.publisher_name,
            "publisher_url": meta.publisher_url,
            "license": meta.license,
            "frequency": meta.frequency,
            "owner": dataset.repo_owner(),
            "owner_avatar": dataset.owner_avatar,
            "github_url": dataset.github_url(),
            "files": files,
        });
        self.render("index", &data)
    }

    pub fn render_file(&self, dataset: &Dataset, file: &DatasetFile) -> Result<String, ViewError> {
        let data = json!({
            "dataset": dataset.name(),
            "dataset_url": dataset.gh_pages_url(),
            "title": file.title,
            "description": file.description,
            "filename": file.effective_filename(),
            "download": file.github_url(dataset),
            "schema": file.schema_name(),
            "schema_url": file.schema.as_ref().map(|s| s.url.as_str()),
        });
        self.render("file", &data)
    }

    /// The index page followed by one page per file, all on [`PAGES_BRANCH`].
    pub fn view_files(&self, dataset: &Dataset) -> Result<Vec<RepoFile>, ViewError> {
        let mut pages = Vec::with_capacity(dataset.files.len() + 1);
        pages.push(
            RepoFile::new("index.html", self.render_index(dataset)?).on_branch(PAGES_BRANCH),
        );
        for file in &dataset.files {
            pages.push(
                RepoFile::new(page_path(file), self.render_file(dataset, file)?)
                    .on_branch(PAGES_BRANCH),
            );
        }
        Ok(pages)
    }
}

/// Path of a file's view page.
pub fn page_path(file: &DatasetFile) -> String {
    let filename = file.effective_filename();
    let stem = filename.strip_suffix(".csv").unwrap_or(&filename);
    Dataset::path(&format!("{stem}.html"), "data")
}

/// Path of a file's data in the repository.
pub fn data_path(file: &DatasetFile) -> String {
    Dataset::path(&file.effective_filename(), "data")
}

/// The `datapackage.json` descriptor for a dataset.
pub fn datapackage(dataset: &Dataset) -> Result<String, ViewError> {
    let meta = &dataset.metadata;
    let resources: Vec<serde_json::Value> = dataset
        .files
        .iter()
        .map(|file| {
            let mut resource = json!({
                "name": file.title,
                "path": data_path(file),
                "mediatype": file.mediatype.as_deref().unwrap_or("text/csv"),
            });
            if let Some(description) = &file.description {
                resource["description"] = json!(description);
            }
            if let Some(schema) = &file.schema {
                resource["schema"] = json!({ "name": schema.name, "url": schema.url });
            }
            resource
        })
        .collect();

    let mut package = json!({
        "name": dataset.repo,
        "title": meta.name,
        "datapackage_version": "1.0-beta.2",
        "resources": resources,
    });
    if let Some(description) = &meta.description {
        package["description"] = json!(description);
    }
    if let Some(license) = &meta.license {
        package["licenses"] = json!([{ "id": license }]);
    }
    if let Some(name) = &meta.publisher_name {
        package["publishers"] = json!([{ "name": name, "web": meta.publisher_url }]);
    }
    if let Some(frequency) = &meta.frequency {
        package["update_frequency"] = json!(frequency);
    }

    serde_json::to_string_pretty(&package).map_err(|e| ViewError::Serialize {
        artifact: "datapackage.json".into(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetMetadata, PublishingMethod, User};
    use crate::schema::TableSchema;
    use crate::storage::StorageKey;

    fn dataset() -> Dataset {
        let meta = DatasetMetadata {
            name: "Cat Census".into(),
            description: Some("Cats <counted>".into()),
            license: Some("OGL-UK-3.0".into()),
            publisher_name: Some("Cat Office".into()),
            publishing_method: PublishingMethod::GithubPublic,
            ..Default::default()
        };
        let mut dataset = Dataset::new(meta, User::new("alice"));
        let mut file = DatasetFile::new("Cats 2024", Some(StorageKey::new("k")));
        file.schema = Some(TableSchema::new(
            "cats",
            "http://example.org/cats.json",
            true,
            false,
        ));
        dataset.add_file(file);
        dataset
    }

    #[test]
    fn test_paths() {
        let file = DatasetFile::new("Cats 2024", None);
        assert_eq!(data_path(&file), "data/cats-2024.csv");
        assert_eq!(page_path(&file), "data/cats-2024.html");
    }

    #[test]
    fn test_render_index_escapes_and_links() {
        let renderer = ViewRenderer::new().unwrap();
        let html = renderer.render_index(&dataset()).unwrap();
        assert!(html.contains("<h1>Cat Census</h1>"));
        assert!(html.contains("Cats &lt;counted&gt;"));
        assert!(html.contains("http://github.com/alice/cat-census/data/cats-2024.csv"));
        assert!(html.contains("Cat Office"));
        assert!(!html.contains("class=\"avatar\""));
    }

    #[test]
    fn test_view_files_target_pages_branch() {
        let renderer = ViewRenderer::new().unwrap();
        let pages = renderer.view_files(&dataset()).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].path, "index.html");
        assert_eq!(pages[1].path, "data/cats-2024.html");
        assert!(pages.iter().all(|p| p.branch.as_deref() == Some(PAGES_BRANCH)));
    }

    #[test]
    fn test_datapackage() {
        let raw = datapackage(&dataset()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["name"], "cat-census");
        assert_eq!(value["title"], "Cat Census");
        assert_eq!(value["licenses"][0]["id"], "OGL-UK-3.0");
        assert_eq!(value["resources"][0]["path"], "data/cats-2024.csv");
        assert_eq!(value["resources"][0]["schema"]["name"], "cats");
        assert!(value.get("update_frequency").is_none());
    }
}
