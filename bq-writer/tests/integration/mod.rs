mod bigquery_client_test;
mod table_writer_test;
