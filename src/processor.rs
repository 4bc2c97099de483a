use crate::handler::{ReadStream, WriteStream};
use crate::options::{ReqOptions, MAX_TRANSFER_SIZE};
use crate::tftp::{self, SocketError, TftpResult};
use std::io;

pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

/// An entity that can process packets and produce a response.
impl PacketProcessor {
    /// Builds the sending side of a transfer (the server answering an RRQ,
    /// or the client half of a PUT). `opt` holds the options the request
    /// carried; a tsize of 0 is answered with the stream's actual size.
    pub fn new_for_reading(
        stream: Box<dyn ReadStream>,
        opt: ReqOptions,
    ) -> TftpResult<PacketProcessor> {
        Ok(PacketProcessor::Read(ReadProcessor::new(stream, opt)?))
    }

    /// Builds the receiving side of a transfer (the server answering a WRQ,
    /// or the client half of a GET). A declared tsize beyond what 16-bit
    /// block numbers can carry is refused here, before any ACK goes out.
    pub fn new_for_writing(
        stream: Box<dyn WriteStream>,
        opt: ReqOptions,
    ) -> TftpResult<PacketProcessor> {
        Ok(PacketProcessor::Write(WriteProcessor::new(stream, opt)?))
    }

    pub async fn first_packet(&mut self) -> ResultAction {
        let first_packet = match self {
            PacketProcessor::Read(_) => tftp::Packet::Ack { block: 0 },
            PacketProcessor::Write(_) => tftp::Packet::Data {
                block: 0,
                data: vec![],
            },
        };
        self.process_packet(&first_packet).await
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet).await,
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should try receiving the last packet again.
    RetryRecv,

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(tftp::Packet),

    /// The transfer is complete. Caller should send the packet (the final
    /// ACK), then listen for one timeout period: a duplicate of the final
    /// DATA means the peer never saw the ACK, and the ACK is re-sent once.
    FinishWithPacket(tftp::Packet),
}

pub struct ReadProcessor {
    stream: Box<dyn ReadStream>,
    curr_block: u16,
    awaiting_final_ack: bool,
    sent_oack: bool,
    opt: ReqOptions,
}

impl ReadProcessor {
    fn new(stream: Box<dyn ReadStream>, mut opt: ReqOptions) -> TftpResult<ReadProcessor> {
        match opt.tsize {
            // The peer asked to be told the size.
            Some(0) => opt.tsize = Some(stream.size()),
            Some(n) if n > MAX_TRANSFER_SIZE => {
                return Err(SocketError::BadOption("transferSize is too big".to_string()))
            }
            _ => {}
        }
        Ok(ReadProcessor {
            stream,
            curr_block: 0,
            awaiting_final_ack: false,
            sent_oack: false,
            opt,
        })
    }

    fn get_block_size(&self) -> usize {
        self.opt.effective_block_size()
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } => {
                match block {
                    block if block == self.curr_block => {
                        if self.awaiting_final_ack {
                            return ResultAction::CloseConnection(None);
                        }
                        if self.curr_block == 0 && !self.sent_oack && !self.opt.is_none() {
                            self.sent_oack = true;
                            return ResultAction::SendPacketAndAwait(tftp::Packet::OptionsAck(
                                self.opt,
                            ));
                        }
                        if self.curr_block == u16::MAX {
                            return ResultAction::TerminateWithPacket(tftp::Packet::Error {
                                code: tftp::ErrorCode::DiskFull,
                                message: "Transfer exceeds the maximum block count".to_string(),
                            });
                        }

                        let block_size = self.get_block_size();
                        match read_block_from_stream(self.stream.as_mut(), block_size).await {
                            Ok(data) => {
                                self.curr_block += 1;
                                if data.len() < block_size {
                                    self.awaiting_final_ack = true;
                                }
                                ResultAction::SendPacketAndAwait(tftp::Packet::Data {
                                    block: self.curr_block,
                                    data,
                                })
                            }
                            Err(e) => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                                code: e.kind().into(),
                                message: format!("Failed to read from file: {:#?}", e),
                            }),
                        }
                    }
                    block if block < self.curr_block => {
                        // Ignore acks for blocks we know have already been acknowledged.
                        ResultAction::RetryRecv
                    }
                    _ => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: tftp::ErrorCode::Illegal,
                        message: format!(
                            "Cannot acknowledge a block which was not yet sent. Server's current block is {cb}, but received an ack for {block}",
                            cb = self.curr_block
                        ),
                    }),
                }
            }
            tftp::Packet::Error { code, message } => ResultAction::CloseConnection(Some(format!(
                "Peer sent error packet: code: {:#?}, message: '{}'",
                code, message
            ))),
            _ => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: tftp::ErrorCode::Illegal,
                message: "Expected to receive an Ack packet".to_string(),
            }),
        }
    }
}

async fn read_block_from_stream(
    stream: &mut dyn ReadStream,
    block_size: usize,
) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;

    // Reading works this way because we have no guarantee that a particular call to read will
    // actually fill the buffer all the way. To compensate for this, if we don't fully fill the
    // buffer on the call to read, we pass a progressively smaller slice of the buffer that we
    // populate the buffer.
    loop {
        match stream.read(&mut buf[cursor..]).await {
            Ok(s) => {
                if cursor + s == buf.len() {
                    return Ok(buf);
                } else if s == 0 {
                    buf.truncate(cursor + s);
                    return Ok(buf);
                } else {
                    cursor += s;
                    continue;
                };
            }
            Err(e) => return Err(e),
        };
    }
}

pub struct WriteProcessor {
    stream: Box<dyn WriteStream>,
    curr_block: u16,
    written: u64,
    limit: u64,
    opt: ReqOptions,
}

impl WriteProcessor {
    fn new(stream: Box<dyn WriteStream>, opt: ReqOptions) -> TftpResult<WriteProcessor> {
        let limit = match opt.tsize {
            // Nothing declared: bounded only by what 16-bit block numbers
            // can address at the negotiated block size.
            Some(0) | None => opt.effective_block_size() as u64 * u16::MAX as u64,
            Some(n) if n > MAX_TRANSFER_SIZE => {
                return Err(SocketError::BadOption("transferSize is too big".to_string()))
            }
            Some(n) => n,
        };
        Ok(WriteProcessor {
            stream,
            curr_block: 0,
            written: 0,
            limit,
            opt,
        })
    }

    fn get_block_size(&self) -> usize {
        self.opt.effective_block_size()
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } => {
                if self.curr_block == u16::MAX {
                    return ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: tftp::ErrorCode::DiskFull,
                        message: "Transfer exceeds the maximum block count".to_string(),
                    });
                }
                match block {
                    block if *block == 0 && self.curr_block == 0 => {
                        let packet = if self.opt.is_none() {
                            tftp::Packet::Ack { block: 0 }
                        } else {
                            tftp::Packet::OptionsAck(self.opt)
                        };
                        ResultAction::SendPacketAndAwait(packet)
                    }
                    block if *block == self.curr_block + 1 => {
                        if self.written + data.len() as u64 > self.limit {
                            return ResultAction::TerminateWithPacket(tftp::Packet::Error {
                                code: tftp::ErrorCode::DiskFull,
                                message: "Transfer exceeds the declared size".to_string(),
                            });
                        }
                        match self.stream.write_all(data).await {
                            Ok(()) => {
                                self.curr_block += 1;
                                self.written += data.len() as u64;
                                let packet = tftp::Packet::Ack {
                                    block: self.curr_block,
                                };

                                if data.len() < self.get_block_size() {
                                    ResultAction::FinishWithPacket(packet)
                                } else {
                                    ResultAction::SendPacketAndAwait(packet)
                                }
                            }
                            Err(e) => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                                code: e.kind().into(),
                                message: format!("Error writing to file: {:#?}", e),
                            }),
                        }
                    }
                    block if *block < self.curr_block + 1 => {
                        // Ignore data packets from previous requests that e.g. may have been
                        // duplicated in transit. Re-acking here would fuel the Sorcerer's
                        // Apprentice loop, so we stay silent and keep waiting.
                        ResultAction::RetryRecv
                    }
                    _ => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: tftp::ErrorCode::Illegal,
                        message: format!(
                            "Data blocks must be received in sequence. Received data for block {block}, \
                            but only blocks up to {cb} have arrived.",
                            cb = self.curr_block
                        ),
                    }),
                }
            }
            tftp::Packet::Error { code, message } => ResultAction::CloseConnection(Some(format!(
                "Peer sent error packet: code: {:#?}, message: '{}'",
                code, message
            ))),
            _ => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: tftp::ErrorCode::Illegal,
                message: "Expected to receive a Data packet".to_string(),
            }),
        }
    }
}
