use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{Body, Client, Response};
use serde_json::Value;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ota")]
#[command(about = "Firmware and file upload tool for IoT OTA devices", long_about = None)]
struct Cli {
    /// Device host name or IP address
    #[arg(short = 'H', long, default_value = "iot-device.local")]
    host: String,

    /// Port number
    #[arg(short, long, default_value = "80")]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware image; the device restarts when it is accepted
    Firmware {
        #[arg(default_value = "target/xtensa-esp32s3-espidf/release/iot-ota-firmware.bin")]
        image: PathBuf,
    },
    /// Upload a file into the device file store
    Upload {
        file: PathBuf,

        /// Target directory on the device
        #[arg(short, long, default_value = "/")]
        dir: String,
    },
    /// List every file with storage usage
    Ls,
    /// List every directory
    Dirs,
    /// Download a file
    Get {
        remote: String,

        /// Local output path (defaults to the remote file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a file or an empty directory
    Rm { path: String },
    /// Create a directory
    Mkdir { path: String },
    /// Print the stored configuration
    Config,
    /// Replace the stored configuration with a JSON file
    SetConfig { file: PathBuf },
    /// Restart the device
    Reboot,
}

struct Device {
    base: String,
    client: Client,
}

impl Device {
    fn new(host: &str, port: u16) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base: base_url(host, port),
            client,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base, endpoint)
    }

    fn get(&self, endpoint: &str) -> Result<Response> {
        let response = self.client.get(self.url(endpoint)).send()?;
        Ok(response)
    }

    /// Stream `path` as the raw request body, with a progress bar.
    fn upload(&self, endpoint: &str, path: &Path, query: &[(&str, &str)]) -> Result<Value> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let size = file.metadata()?.len();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Local path has no usable file name")?
            .to_string();

        let pb = ProgressBar::new(size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
                .progress_chars("#>-"),
        );

        let result = self
            .client
            .post(self.url(endpoint))
            .query(query)
            .header("X-Filename", filename)
            .header("Content-Type", "application/octet-stream")
            .body(Body::sized(pb.wrap_read(file), size))
            .send();
        pb.finish_and_clear();
        json_body(result?)
    }
}

fn base_url(host: &str, port: u16) -> String {
    if port == 80 {
        format!("http://{host}")
    } else {
        format!("http://{host}:{port}")
    }
}

/// Decode a JSON reply, turning `{"status": "nokN", "error": ...}` into an error.
fn json_body(response: Response) -> Result<Value> {
    let status = response.status();
    let text = response.text()?;
    let value: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
    if !status.is_success() {
        bail!("HTTP {}: {}", status, describe_failure(&value));
    }
    Ok(value)
}

fn describe_failure(value: &Value) -> String {
    match (value.get("status").and_then(Value::as_str), value.get("error").and_then(Value::as_str)) {
        (Some(tag), Some(error)) => format!("{error} ({tag})"),
        _ => value.to_string(),
    }
}

fn format_size(bytes: u64) -> String {
    match bytes {
        b if b >= 1024 * 1024 => format!("{:.2} MB", b as f64 / 1024.0 / 1024.0),
        b if b >= 1024 => format!("{:.1} KB", b as f64 / 1024.0),
        b => format!("{b} B"),
    }
}

/// One line per entry of a `/api/files` listing.
fn listing_lines(listing: &Value) -> Vec<String> {
    let Some(files) = listing.get("files").and_then(Value::as_array) else {
        return Vec::new();
    };
    files
        .iter()
        .map(|entry| {
            let name = entry.get("name").and_then(Value::as_str).unwrap_or("?");
            if entry.get("type").and_then(Value::as_str) == Some("directory") {
                format!("{:>10}  {}/", "<dir>", name)
            } else {
                let size = entry.get("size").and_then(Value::as_u64).unwrap_or(0);
                format!("{:>10}  {}", format_size(size), name)
            }
        })
        .collect()
}

fn default_output(remote: &str) -> PathBuf {
    let name = remote.rsplit('/').find(|part| !part.is_empty()).unwrap_or("download.bin");
    PathBuf::from(name)
}

fn print_message(value: &Value) {
    let message = value.get("message").and_then(Value::as_str).unwrap_or("OK");
    println!("{} {}", "✅".green(), message);
}

fn run(cli: Cli) -> Result<()> {
    let device = Device::new(&cli.host, cli.port)?;

    match cli.command {
        Commands::Firmware { image } => {
            if !image.exists() {
                bail!("Firmware not found: {} (build with cargo build --release first)", image.display());
            }
            println!("{} Flashing {} to {}", "🚀".blue(), image.display(), device.base);
            let reply = device.upload("/api/firmware", &image, &[])?;
            if let Some(sha) = reply.get("sha256").and_then(Value::as_str) {
                println!("   SHA-256: {}", sha.dimmed());
            }
            print_message(&reply);
            println!("{}", "Device will restart.".green());
        }
        Commands::Upload { file, dir } => {
            println!("{} Uploading {} into {}", "📤".cyan(), file.display(), dir);
            let reply = device.upload("/api/upload", &file, &[("directory", dir.as_str())])?;
            print_message(&reply);
        }
        Commands::Ls => {
            let listing = json_body(device.get("/api/files")?)?;
            for line in listing_lines(&listing) {
                println!("{line}");
            }
            let used = listing.get("used").and_then(Value::as_u64).unwrap_or(0);
            let total = listing.get("total").and_then(Value::as_u64).unwrap_or(0);
            println!("\n{} used of {}", format_size(used), format_size(total));
        }
        Commands::Dirs => {
            let dirs = json_body(device.get("/api/directories")?)?;
            for dir in dirs.as_array().into_iter().flatten().filter_map(Value::as_str) {
                println!("{dir}");
            }
        }
        Commands::Get { remote, output } => {
            let response = device.client.get(device.url("/api/download")).query(&[("file", remote.as_str())]).send()?;
            if !response.status().is_success() {
                json_body(response)?;
                bail!("Download failed");
            }
            let output = output.unwrap_or_else(|| default_output(&remote));
            let bytes = response.bytes()?;
            fs::write(&output, &bytes).with_context(|| format!("Failed to write {}", output.display()))?;
            println!("{} {} -> {} ({})", "📥".cyan(), remote, output.display(), format_size(bytes.len() as u64));
        }
        Commands::Rm { path } => {
            let response = device.client.delete(device.url("/api/delete")).query(&[("path", path.as_str())]).send()?;
            print_message(&json_body(response)?);
        }
        Commands::Mkdir { path } => {
            let trimmed = path.trim_end_matches('/');
            let (parent, name) = match trimmed.rsplit_once('/') {
                Some(("", name)) => ("/", name),
                Some((parent, name)) => (parent, name),
                None => ("/", trimmed),
            };
            let body = serde_json::json!({ "parentPath": parent, "dirName": name });
            let response = device.client.post(device.url("/api/addDirectory")).json(&body).send()?;
            print_message(&json_body(response)?);
        }
        Commands::Config => {
            let config = json_body(device.get("/api/config/read")?)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::SetConfig { file } => {
            let raw = fs::read_to_string(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let value: Value = serde_json::from_str(&raw).context("Configuration file is not valid JSON")?;
            let response = device.client.post(device.url("/api/config/save")).json(&value).send()?;
            print_message(&json_body(response)?);
            println!("   Changes apply after the next reboot.");
        }
        Commands::Reboot => {
            print_message(&json_body(device.get("/api/reboot")?)?);
        }
    }
    Ok(())
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_omits_default_port() {
        assert_eq!(base_url("10.0.0.5", 80), "http://10.0.0.5");
        assert_eq!(base_url("iot-device.local", 8080), "http://iot-device.local:8080");
    }

    #[test]
    fn test_describe_failure() {
        let value = serde_json::json!({ "status": "nok3", "error": "Failed to create directory" });
        assert_eq!(describe_failure(&value), "Failed to create directory (nok3)");
        assert_eq!(describe_failure(&Value::String("File Not Found".into())), "\"File Not Found\"");
    }

    #[test]
    fn test_listing_lines() {
        let listing = serde_json::json!({
            "total": 4096, "used": 1024, "free": 3072,
            "files": [
                { "name": "/www", "type": "directory", "size": 0 },
                { "name": "/www/index.html", "type": "file", "size": 2048 }
            ]
        });
        let lines = listing_lines(&listing);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("/www/"));
        assert!(lines[1].contains("2.0 KB"));
        assert!(lines[1].ends_with("/www/index.html"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_default_output() {
        assert_eq!(default_output("/logs/boot.log"), PathBuf::from("boot.log"));
        assert_eq!(default_output("/"), PathBuf::from("download.bin"));
    }

    #[test]
    fn test_cli_parses_upload() {
        let cli = Cli::try_parse_from(["ota", "-H", "10.0.0.5", "upload", "page.html", "--dir", "/public_html"]).unwrap();
        assert_eq!(cli.host, "10.0.0.5");
        match cli.command {
            Commands::Upload { file, dir } => {
                assert_eq!(file, PathBuf::from("page.html"));
                assert_eq!(dir, "/public_html");
            }
            _ => panic!("expected upload"),
        }
    }
}
