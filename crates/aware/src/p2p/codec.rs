//! 局域网传输协议 Codec
//!
//! 两个 request_response 协议：
//!
//! - `service-info`：订阅方向 mDNS 发现的节点查询它发布的服务和房间，JSON 编码；
//! - `datagram`：携带原始数据报负载，响应为空确认。
//!
//! 所有帧都是 4 字节大端长度前缀加数据。

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response;
use serde::{Deserialize, Serialize};
use std::io;

use super::config::DEFAULT_MAX_DATAGRAM_SIZE;

/// 服务信息协议名称
pub const SERVICE_INFO_PROTOCOL: &str = "/lchat/service-info/1.0.0";

/// 数据报协议名称
pub const DATAGRAM_PROTOCOL: &str = "/lchat/datagram/1.0.0";

/// 服务信息帧上限
const MAX_SERVICE_INFO_SIZE: usize = 4 * 1024;

/// 服务信息协议（标记类型）
#[derive(Debug, Clone, Default)]
pub struct ServiceInfoProtocol;

impl AsRef<str> for ServiceInfoProtocol {
    fn as_ref(&self) -> &str {
        SERVICE_INFO_PROTOCOL
    }
}

/// 数据报协议（标记类型）
#[derive(Debug, Clone, Default)]
pub struct DatagramProtocol;

impl AsRef<str> for DatagramProtocol {
    fn as_ref(&self) -> &str {
        DATAGRAM_PROTOCOL
    }
}

/// 服务查询
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceQuery {
    /// 要查询的服务名称
    pub service_name: String,
}

/// 服务通告
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceAdvert {
    /// 服务名称
    pub service_name: String,

    /// 发布的房间名（没有发布该服务时为 None）
    pub room_name: Option<String>,
}

/// 读取一个长度前缀帧
async fn read_frame<T>(io: &mut T, max_size: usize) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("帧过大: {} 字节 (上限 {})", len, max_size),
        ));
    }

    let mut buffer = vec![0u8; len];
    io.read_exact(&mut buffer).await?;
    Ok(buffer)
}

/// 写入一个长度前缀帧
async fn write_frame<T>(io: &mut T, data: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "帧长度超出 u32"))?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// 服务信息 Codec
#[derive(Debug, Clone, Default)]
pub struct ServiceInfoCodec;

#[async_trait]
impl request_response::Codec for ServiceInfoCodec {
    type Protocol = ServiceInfoProtocol;
    type Request = ServiceQuery;
    type Response = ServiceAdvert;

    async fn read_request<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buffer = read_frame(io, MAX_SERVICE_INFO_SIZE).await?;
        serde_json::from_slice(&buffer).map_err(invalid_data)
    }

    async fn read_response<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buffer = read_frame(io, MAX_SERVICE_INFO_SIZE).await?;
        serde_json::from_slice(&buffer).map_err(invalid_data)
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let data = serde_json::to_vec(&req).map_err(invalid_data)?;
        write_frame(io, &data).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let data = serde_json::to_vec(&res).map_err(invalid_data)?;
        write_frame(io, &data).await
    }
}

/// 数据报 Codec
///
/// 请求是原始负载，响应是空帧。
#[derive(Debug, Clone)]
pub struct DatagramCodec {
    max_size: usize,
}

impl Default for DatagramCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DATAGRAM_SIZE)
    }
}

impl DatagramCodec {
    /// 创建指定负载上限的 Codec
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    /// 负载上限
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[async_trait]
impl request_response::Codec for DatagramCodec {
    type Protocol = DatagramProtocol;
    type Request = Vec<u8>;
    type Response = ();

    async fn read_request<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io, self.max_size).await
    }

    async fn read_response<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io, 0).await.map(|_| ())
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        if req.len() > self.max_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("数据报过大: {} 字节", req.len()),
            ));
        }
        write_frame(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        _res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use libp2p::request_response::Codec;

    #[test]
    fn test_protocol_names() {
        assert_eq!(ServiceInfoProtocol.as_ref(), "/lchat/service-info/1.0.0");
        assert_eq!(DatagramProtocol.as_ref(), "/lchat/datagram/1.0.0");
    }

    #[tokio::test]
    async fn test_service_advert_framing() {
        let mut codec = ServiceInfoCodec;
        let advert = ServiceAdvert {
            service_name: "lchat".to_string(),
            room_name: Some("客厅".to_string()),
        };

        let mut buffer = Cursor::new(Vec::new());
        codec
            .write_response(&ServiceInfoProtocol, &mut buffer, advert.clone())
            .await
            .unwrap();

        let bytes = buffer.into_inner();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);

        let mut reader = Cursor::new(bytes);
        let decoded = codec.read_response(&ServiceInfoProtocol, &mut reader).await.unwrap();
        assert_eq!(decoded, advert);
    }

    #[tokio::test]
    async fn test_datagram_is_raw_bytes() {
        let mut codec = DatagramCodec::default();

        let mut buffer = Cursor::new(Vec::new());
        codec
            .write_request(&DatagramProtocol, &mut buffer, b"alice|Alice|hi".to_vec())
            .await
            .unwrap();

        let bytes = buffer.into_inner();
        assert_eq!(&bytes[4..], b"alice|Alice|hi");

        let mut reader = Cursor::new(bytes);
        let payload = codec.read_request(&DatagramProtocol, &mut reader).await.unwrap();
        assert_eq!(payload, b"alice|Alice|hi".to_vec());
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let mut codec = DatagramCodec::new(8);

        let mut buffer = Cursor::new(Vec::new());
        let err = codec
            .write_request(&DatagramProtocol, &mut buffer, vec![0u8; 9])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let mut frame = 9u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 9]);
        let mut reader = Cursor::new(frame);
        let err = codec.read_request(&DatagramProtocol, &mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
