use std::sync::Arc;

use async_stream::try_stream;
use domain::{ConversationId, Message};
use futures::Stream;

use crate::error::ApplicationError;
use crate::message_store::MessageStore;

/// 每次向存储请求的页大小
const CATCH_UP_PAGE_SIZE: u32 = 100;

/// 按序号升序惰性地读取 `after_sequence` 之后的消息。
///
/// 流是有限的：读到末尾或读满 `limit` 条后结束。断线重连的客户端
/// 用最后见到的序号重新调用即可从断点继续。
pub fn list_messages(
    store: Arc<dyn MessageStore>,
    conversation_id: ConversationId,
    after_sequence: u64,
    limit: Option<usize>,
) -> impl Stream<Item = Result<Message, ApplicationError>> + Send + 'static {
    try_stream! {
        let mut cursor = after_sequence;
        let mut remaining = limit;

        loop {
            let page_size = match remaining {
                Some(0) => break,
                Some(left) => left.min(CATCH_UP_PAGE_SIZE as usize) as u32,
                None => CATCH_UP_PAGE_SIZE,
            };

            let page = store
                .messages_after(conversation_id, cursor, page_size)
                .await
                .map_err(ApplicationError::from)?;
            let fetched = page.len();

            for message in page {
                cursor = message.sequence;
                yield message;
            }

            if let Some(left) = remaining.as_mut() {
                *left -= fetched;
            }
            if fetched < page_size as usize {
                break;
            }
        }
    }
}
