//! 输出解析函数

use super::types::ChunkData;
use std::path::PathBuf;

/// nvm 安装脚本写入（或发现已写入）profile 时输出的两种前缀
const NVM_PROFILE_SIGNALS: [&str; 2] = [
    "=> Appending nvm source string to ",
    "=> nvm source string already in ",
];

/// 从安装输出中提取被修改的 profile 路径
///
/// 只认 nvm 的两条固定提示；任意一行以其开头即命中，取第一处。
pub fn profile_path_from_transcript(transcript: &str) -> Option<PathBuf> {
    let cleaned = clean_terminal_output(transcript);
    cleaned.lines().find_map(|line| {
        NVM_PROFILE_SIGNALS.iter().find_map(|signal| {
            let path = line.strip_prefix(signal)?.trim_end();
            if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            }
        })
    })
}

/// 清理终端输出中的 ANSI 转义序列和特殊字符
pub fn clean_terminal_output(input: &str) -> String {
    let mut result = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => {
                if chars.peek() == Some(&'[') {
                    chars.next();
                    while let Some(&next) = chars.peek() {
                        chars.next();
                        if next.is_ascii_alphabetic() {
                            break;
                        }
                    }
                }
            }
            '\r' => {
                if chars.peek() != Some(&'\n') && !result.ends_with('\n') {
                    result.push('\n');
                }
            }
            c if c.is_control() && c != '\n' && c != '\t' => {}
            _ => result.push(c),
        }
    }

    result
}

/// 管道读取的字节块 → 字符串，跨块截断的多字节字符留到下一块
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid 之前已校验为合法 UTF-8
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // 末尾不完整，等下一块
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }

        out
    }

    /// 进程结束时把残留字节按有损方式输出
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

/// 按 `\n` 重新切分输出块；完整行 ln = true，末尾残行在 finish 时 ln = false
#[derive(Debug, Default)]
pub struct LineBuffer {
    line_buffer: String,
}

impl LineBuffer {
    pub fn push(&mut self, text: &str) -> Vec<ChunkData> {
        let mut lines = Vec::new();
        for c in text.chars() {
            self.line_buffer.push(c);
            if c == '\n' {
                lines.push(ChunkData {
                    chunk: std::mem::take(&mut self.line_buffer),
                    ln: true,
                });
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<ChunkData> {
        if self.line_buffer.is_empty() {
            None
        } else {
            Some(ChunkData {
                chunk: std::mem::take(&mut self.line_buffer),
                ln: false,
            })
        }
    }
}
