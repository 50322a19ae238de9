use anyhow::Result;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Lines replayed to a newly connected client.
pub const HISTORY_LINES: usize = 100;

/// Ring buffer for storing recent log messages
struct LogBuffer {
    buffer: Vec<String>,
    capacity: usize,
    write_index: usize,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            write_index: 0,
        }
    }

    fn push(&mut self, message: String) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(message);
        } else {
            self.buffer[self.write_index] = message;
            self.write_index = (self.write_index + 1) % self.capacity;
        }
    }

    /// Oldest first.
    fn get_all(&self) -> Vec<String> {
        if self.buffer.len() < self.capacity {
            return self.buffer.clone();
        }
        (0..self.capacity)
            .map(|i| self.buffer[(self.write_index + i) % self.capacity].clone())
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Telnet server for remote log streaming
pub struct TelnetLogServer {
    log_buffer: Mutex<LogBuffer>,
    clients: Mutex<Vec<TcpStream>>,
    port: u16,
}

impl TelnetLogServer {
    pub fn new(port: u16) -> Self {
        Self {
            log_buffer: Mutex::new(LogBuffer::new(HISTORY_LINES)),
            clients: Mutex::new(Vec::new()),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the telnet server in a background thread
    pub fn start(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        let server = self.clone();

        thread::Builder::new()
            .name("telnet-server".to_string())
            .stack_size(4096)
            .spawn(move || server.run_server(listener))?;

        log::info!("Telnet log server started on port {}", self.port);
        Ok(())
    }

    fn run_server(&self, listener: TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("Telnet client connected from {}", addr);
                    if let Err(e) = self.attach(stream) {
                        log::warn!("Dropping telnet client {}: {}", addr, e);
                    }
                }
                Err(e) => {
                    log::error!("Telnet accept error: {:?}", e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Greet the client, replay the history, then stream live lines to it.
    fn attach(&self, mut stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        write!(stream, "\r\n=== IoT OTA Firmware Remote Log ===\r\n")?;
        write!(stream, "--- Recent log history ---\r\n")?;
        for line in self.recent_lines() {
            stream.write_all(line.as_bytes())?;
        }
        write!(stream, "--- End of history ---\r\n")?;
        lock(&self.clients).push(stream);
        Ok(())
    }

    pub fn recent_lines(&self) -> Vec<String> {
        lock(&self.log_buffer).get_all()
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Buffer a line and send it to every client. Clients whose socket
    /// fails are dropped.
    pub fn log_message(&self, message: &str) {
        let line = format!("{message}\r\n");
        lock(&self.log_buffer).push(line.clone());

        lock(&self.clients).retain_mut(|client| client.write_all(line.as_bytes()).is_ok());
    }
}
