use std::path::{Path, PathBuf};

use crate::models::Job;

pub fn job_dir(data_dir: &str, job_id: &str) -> PathBuf {
    Path::new(data_dir).join("jobs").join(job_id)
}

pub fn job_json_path(data_dir: &str, job_id: &str) -> PathBuf {
    job_dir(data_dir, job_id).join("job.json")
}

pub fn input_pdf_path(data_dir: &str, job_id: &str) -> PathBuf {
    job_dir(data_dir, job_id).join("input.pdf")
}

pub fn output_epub_path(data_dir: &str, job_id: &str) -> PathBuf {
    job_dir(data_dir, job_id).join("output.epub")
}

pub fn pages_dir(data_dir: &str, job_id: &str) -> PathBuf {
    job_dir(data_dir, job_id).join("pages")
}

pub fn page_text_path(data_dir: &str, job_id: &str, page_index: usize) -> PathBuf {
    pages_dir(data_dir, job_id).join(format!("{page_index:05}.txt"))
}

/// Writes `contents` to `path` via write-to-tempfile-then-rename, matching
/// spec §4.5's durability requirement. The temp file lives alongside the
/// target so the rename is same-filesystem and therefore atomic.
pub async fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    tokio::fs::create_dir_all(parent).await?;
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("write")
    ));
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

pub async fn persist_job(data_dir: &str, job: &Job) -> std::io::Result<()> {
    let path = job_json_path(data_dir, &job.id);
    let contents = serde_json::to_vec_pretty(job)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    atomic_write(&path, &contents).await
}

pub async fn load_job(path: &Path) -> std::io::Result<Job> {
    let contents = tokio::fs::read(path).await?;
    serde_json::from_slice(&contents)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_match_spec_section_3() {
        assert_eq!(
            job_json_path("./data", "abc").to_string_lossy(),
            "./data/jobs/abc/job.json"
        );
        assert_eq!(
            input_pdf_path("./data", "abc").to_string_lossy(),
            "./data/jobs/abc/input.pdf"
        );
        assert_eq!(
            output_epub_path("./data", "abc").to_string_lossy(),
            "./data/jobs/abc/output.epub"
        );
        assert_eq!(
            page_text_path("./data", "abc", 7).to_string_lossy(),
            "./data/jobs/abc/pages/00007.txt"
        );
    }

    #[tokio::test]
    async fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("file.txt");
        atomic_write(&path, b"hello").await.unwrap();
        let read_back = tokio::fs::read(&path).await.unwrap();
        assert_eq!(read_back, b"hello");
        // no stray temp file left behind
        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
